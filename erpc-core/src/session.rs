//! Session and SSlot management for erpc-core.
//!
//! A session represents one client-server relationship between two
//! endpoints. SSlots (session slots) track individual request/response
//! transactions; a session has `req_window` of them on both sides.
//!
//! Slot assignment is fixed: `sslot_idx = req_num % req_window`. Slot `i`
//! starts at request number `i` and every new request on it advances the
//! number by `req_window`, so the server can tell a new request from a
//! retransmission or a stale packet by comparing request numbers alone.

use crate::buffer::MsgBuffer;
use crate::error::{Error, Result};
use crate::flow_control::CreditWindow;
use crate::reliability::{PktTracker, RetryState};
use crate::sm::SmErrType;
use crate::transport::RoutingInfo;

/// Which side of the session this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, waiting for the response.
    ConnectInProgress,
    /// Session is connected and ready for requests.
    Connected,
    /// Disconnect requested; waiting for outstanding requests to drain or
    /// for the disconnect response.
    DisconnectInProgress,
    /// Handshake completed; the session number is free again.
    Disconnected,
    /// The handshake failed. The session can only be destroyed.
    Error,
}

/// A handle to a session.
///
/// Carries a generation so that a handle to a destroyed session never
/// resolves to a later session that reused its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    num: u16,
    generation: u32,
}

impl SessionHandle {
    /// Handle that never names a session.
    pub const NULL: SessionHandle = SessionHandle {
        num: u16::MAX,
        generation: 0,
    };

    pub(crate) fn new(num: u16, generation: u32) -> Self {
        Self { num, generation }
    }

    /// Get the session number.
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.num
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Check if this is the null handle.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.num == u16::MAX
    }
}

// =============================================================================
// SSlot
// =============================================================================

/// Client half of an SSlot.
#[derive(Debug)]
pub struct ClientSlot<P> {
    /// The in-flight request, if any.
    pub pending: Option<P>,
    /// Response packets received so far.
    pub resp_tracker: PktTracker,
    /// Declared size of the response being received.
    pub resp_msg_size: usize,
    /// Retransmission budget of the in-flight request.
    pub retry: RetryState,
}

/// Server-side progress of the current request of an SSlot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSlotState {
    /// No request seen yet.
    Idle,
    /// Collecting packets of a multi-packet request.
    Reassembling,
    /// The request handler has run (or is running) and has not responded.
    InHandler,
    /// The response is stored and can be retransmitted.
    Responded,
}

/// Server half of an SSlot.
#[derive(Debug)]
pub struct ServerSlot {
    pub state: ServerSlotState,
    /// Request packets received so far (multi-packet requests).
    pub req_tracker: PktTracker,
    /// Reassembly buffer of a multi-packet request.
    pub req_buf: Option<MsgBuffer>,
    /// Preallocated single-packet response buffer.
    pub pre_resp: Option<MsgBuffer>,
    /// Response buffer for responses larger than `pre_resp`.
    pub dyn_resp: Option<MsgBuffer>,
}

impl ServerSlot {
    /// Buffer holding the stored response.
    #[inline]
    pub fn resp_buf(&self) -> Option<&MsgBuffer> {
        self.dyn_resp.as_ref().or(self.pre_resp.as_ref())
    }
}

/// Session Slot (SSlot) for tracking a single request/response transaction.
#[derive(Debug)]
pub struct SSlot<P> {
    /// Slot index within the session (0..req_window).
    pub index: usize,
    /// Request number of the current (or last) request on this slot.
    pub cur_req_num: u64,
    /// Request type of the current request.
    pub req_type: u8,
    pub client: ClientSlot<P>,
    pub server: ServerSlot,
}

impl<P> SSlot<P> {
    pub fn new(index: usize, max_retries: u32) -> Self {
        Self {
            index,
            cur_req_num: index as u64,
            req_type: 0,
            client: ClientSlot {
                pending: None,
                resp_tracker: PktTracker::new(),
                resp_msg_size: 0,
                retry: RetryState::new(max_retries),
            },
            server: ServerSlot {
                state: ServerSlotState::Idle,
                req_tracker: PktTracker::new(),
                req_buf: None,
                pre_resp: None,
                dyn_resp: None,
            },
        }
    }

    /// Check if a client request is in flight on this slot.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.client.pending.is_some()
    }

    /// Take every MsgBuffer the server half owns.
    pub fn take_server_buffers(&mut self) -> impl Iterator<Item = MsgBuffer> + use<P> {
        [
            self.server.req_buf.take(),
            self.server.pre_resp.take(),
            self.server.dyn_resp.take(),
        ]
        .into_iter()
        .flatten()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A session between this endpoint and one remote endpoint.
///
/// `P` is the per-request state the endpoint keeps for in-flight client
/// requests (continuation, tag and buffers).
#[derive(Debug)]
pub struct Session<P> {
    pub role: SessionRole,
    pub state: SessionState,
    /// Generation of the session number at creation.
    pub generation: u32,
    /// Local session number.
    pub local_session_num: u16,
    /// Remote session number (valid once connected).
    pub remote_session_num: u16,
    /// Wire generation of the remote session, stamped on outgoing packets.
    pub remote_session_gen: u16,
    /// URI of the remote host.
    pub remote_uri: String,
    pub remote_rpc_id: u8,
    /// Token identifying this session's handshake.
    pub uniq_token: u64,
    /// Resolved routing info of the remote transport endpoint.
    pub remote_routing: RoutingInfo,
    pub sslots: Vec<SSlot<P>>,
    /// Free client slots.
    pub credits: CreditWindow,
    /// Disconnect requested while requests were still in flight.
    pub disconnect_queued: bool,
    /// Retry budget of the pending handshake packet.
    pub sm_retry: RetryState,
    /// Handshake attempt counter, to ignore stale SM timers.
    pub sm_seq: u64,
    /// Error that moved the session to `Error`.
    pub sm_err: SmErrType,
}

impl<P> Session<P> {
    /// Create a session in its initial state for `role`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: SessionRole,
        remote_uri: String,
        remote_rpc_id: u8,
        uniq_token: u64,
        req_window: usize,
        max_retries: u32,
        sm_max_retries: u32,
    ) -> Self {
        let state = match role {
            SessionRole::Client => SessionState::ConnectInProgress,
            SessionRole::Server => SessionState::Connected,
        };
        Self {
            role,
            state,
            generation: 0,
            local_session_num: 0,
            remote_session_num: 0,
            remote_session_gen: 0,
            remote_uri,
            remote_rpc_id,
            uniq_token,
            remote_routing: RoutingInfo::default(),
            sslots: (0..req_window)
                .map(|i| SSlot::new(i, max_retries))
                .collect(),
            credits: CreditWindow::new(req_window),
            disconnect_queued: false,
            sm_retry: RetryState::new(sm_max_retries),
            sm_seq: 0,
            sm_err: SmErrType::NoError,
        }
    }

    /// Get the session handle.
    #[inline]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.local_session_num, self.generation)
    }

    /// Generation as carried in packet headers.
    #[inline]
    pub fn wire_generation(&self) -> u16 {
        self.generation as u16
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Check if the session is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Request window size.
    #[inline]
    pub fn req_window(&self) -> usize {
        self.sslots.len()
    }

    /// SSlot index of a request number.
    #[inline]
    pub fn sslot_idx(&self, req_num: u64) -> usize {
        (req_num % self.sslots.len() as u64) as usize
    }

    /// Check if the session can accept data-plane packets for its role.
    #[inline]
    pub fn accepts_data(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connected | SessionState::DisconnectInProgress
        )
    }

    /// Check if a queued disconnect can be sent now.
    #[inline]
    pub fn disconnect_ready(&self) -> bool {
        self.disconnect_queued && self.credits.is_drained()
    }
}

// =============================================================================
// Session Table
// =============================================================================

/// Session table for managing multiple sessions.
#[derive(Debug)]
pub struct SessionTable<P> {
    sessions: Vec<Option<Session<P>>>,
    /// Next session number to try.
    next_session_num: u16,
    /// Bumped on every insert.
    next_generation: u32,
    active: usize,
}

impl<P> SessionTable<P> {
    /// Create a new session table.
    pub fn new(max_sessions: usize) -> Self {
        debug_assert!(max_sessions < u16::MAX as usize);
        Self {
            sessions: (0..max_sessions).map(|_| None).collect(),
            next_session_num: 0,
            next_generation: 1,
            active: 0,
        }
    }

    /// Allocate a session number, round robin so recently freed numbers are
    /// reused last.
    fn alloc_session_num(&mut self) -> Option<u16> {
        let start = self.next_session_num as usize;
        for i in 0..self.sessions.len() {
            let idx = (start + i) % self.sessions.len();
            if self.sessions[idx].is_none() {
                self.next_session_num = ((idx + 1) % self.sessions.len()) as u16;
                return Some(idx as u16);
            }
        }
        None
    }

    /// Insert a session, assigning its local number and generation.
    pub fn insert(&mut self, mut session: Session<P>) -> Result<SessionHandle> {
        let num = self.alloc_session_num().ok_or(Error::TooManySessions)?;
        session.local_session_num = num;
        session.generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let handle = session.handle();
        self.sessions[num as usize] = Some(session);
        self.active += 1;
        Ok(handle)
    }

    /// Get a reference to a session.
    pub fn get(&self, handle: SessionHandle) -> Option<&Session<P>> {
        self.get_by_num(handle.num)
            .filter(|s| s.generation == handle.generation)
    }

    /// Get a mutable reference to a session.
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session<P>> {
        self.get_by_num_mut(handle.num)
            .filter(|s| s.generation == handle.generation)
    }

    /// Look a session up by the number carried in a packet.
    #[inline]
    pub fn get_by_num(&self, num: u16) -> Option<&Session<P>> {
        self.sessions.get(num as usize).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn get_by_num_mut(&mut self, num: u16) -> Option<&mut Session<P>> {
        self.sessions.get_mut(num as usize).and_then(|s| s.as_mut())
    }

    /// Remove a session.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session<P>> {
        let slot = self.sessions.get_mut(handle.num as usize)?;
        if slot.as_ref()?.generation != handle.generation {
            return None;
        }
        self.active -= 1;
        slot.take()
    }

    /// Get the number of active sessions.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Iterate over all active sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session<P>> {
        self.sessions.iter().filter_map(|s| s.as_ref())
    }

    /// Iterate mutably over all active sessions.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<P>> {
        self.sessions.iter_mut().filter_map(|s| s.as_mut())
    }
}
