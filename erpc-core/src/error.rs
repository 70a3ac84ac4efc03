//! Error types for erpc-core.

use std::io;

use thiserror::Error;

use crate::buffer::MsgBuffer;
use crate::sm::SmErrType;

/// RPC operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error from the transport layer.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The MsgBuffer arena cannot satisfy the allocation.
    #[error("MsgBuffer arena exhausted ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    /// The session handle does not name a live session of this endpoint.
    #[error("Invalid session {0}")]
    InvalidSession(u16),

    /// The session exists but is not in the `Connected` state.
    #[error("Session {0} is not connected")]
    SessionNotConnected(u16),

    /// Every request slot of the session is in flight.
    #[error("Session {0} has no free request slot")]
    CreditExhausted(u16),

    /// The connect or disconnect handshake failed.
    #[error("Session handshake failed: {0}")]
    HandshakeFailed(SmErrType),

    /// The per-request retransmission budget ran out.
    #[error("Request {req_num} on session {session} timed out")]
    RequestTimedOut { session: u16, req_num: u64 },

    /// The request slot has already moved on to a newer request.
    #[error("Request {req_num} on session {session} is no longer awaiting a response")]
    StaleRequest { session: u16, req_num: u64 },

    /// Message exceeds the configured maximum size.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Buffer too small for the requested length.
    #[error("Buffer too small: required {required}, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// The MsgBuffer handle was not allocated by this endpoint or was freed.
    #[error("Invalid MsgBuffer handle")]
    InvalidMsgBuffer,

    /// Invalid magic number in a packet header.
    #[error("Invalid magic: expected 0x{expected:02x}, got 0x{got:02x}")]
    InvalidMagic { expected: u8, got: u8 },

    /// Invalid packet type in a packet header.
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another endpoint already registered this rpc id with the nexus.
    #[error("Rpc id {0} is already registered")]
    RpcIdInUse(u8),

    /// The session table is full.
    #[error("Too many sessions")]
    TooManySessions,

    /// The remote endpoint cannot be used for a session.
    #[error("Invalid remote endpoint: {0}")]
    InvalidRemote(String),
}

/// Result type for erpc-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error from [`Rpc::enqueue_request()`](crate::Rpc::enqueue_request).
///
/// Enqueue failures never consume the caller's buffers or tag: they come back
/// here so the request can be retried later.
#[derive(Debug)]
pub struct EnqueueError<U> {
    pub error: Error,
    pub req: MsgBuffer,
    pub resp: MsgBuffer,
    pub tag: U,
}

impl<U> EnqueueError<U> {
    /// Check if the failure is backpressure rather than misuse.
    #[inline]
    pub fn is_backpressure(&self) -> bool {
        matches!(self.error, Error::CreditExhausted(_))
    }

    /// Split into the error and the returned buffers and tag.
    pub fn into_parts(self) -> (Error, MsgBuffer, MsgBuffer, U) {
        (self.error, self.req, self.resp, self.tag)
    }
}

impl<U> std::fmt::Display for EnqueueError<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl<U: std::fmt::Debug> std::error::Error for EnqueueError<U> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
