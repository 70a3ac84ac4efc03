//! Session-management (SM) packets and events.
//!
//! SM packets travel on the control plane (see [`Nexus`](crate::Nexus)),
//! never on the data-plane transport. They establish and tear down sessions
//! and carry the routing info each side needs to reach the other.

use std::fmt;

use crate::transport::RoutingInfo;

/// SM packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmPktType {
    ConnectRequest,
    ConnectResponse,
    DisconnectRequest,
    DisconnectResponse,
}

impl SmPktType {
    /// Check if this is a request (client to server).
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(self, SmPktType::ConnectRequest | SmPktType::DisconnectRequest)
    }

    /// Response type for a request type.
    #[inline]
    pub fn response_type(self) -> SmPktType {
        match self {
            SmPktType::ConnectRequest | SmPktType::ConnectResponse => SmPktType::ConnectResponse,
            SmPktType::DisconnectRequest | SmPktType::DisconnectResponse => {
                SmPktType::DisconnectResponse
            }
        }
    }
}

/// Error kind carried by SM responses and reported to the SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmErrType {
    NoError,
    /// The server's session table is full.
    TooManySessions,
    /// The server could not allocate per-session buffers.
    OutOfMemory,
    /// Routing info of the peer could not be resolved.
    RoutingResolutionFailure,
    /// No endpoint with the requested rpc id exists at the remote URI.
    InvalidRemoteRpcId,
    /// The handshake's retry budget ran out.
    HandshakeTimedOut,
}

impl fmt::Display for SmErrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SmErrType::NoError => "no error",
            SmErrType::TooManySessions => "too many sessions",
            SmErrType::OutOfMemory => "out of memory",
            SmErrType::RoutingResolutionFailure => "routing resolution failure",
            SmErrType::InvalidRemoteRpcId => "invalid remote rpc id",
            SmErrType::HandshakeTimedOut => "handshake timed out",
        };
        f.write_str(s)
    }
}

/// Session event reported to the SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    Connected,
    ConnectFailed,
    Disconnected,
    DisconnectFailed,
}

/// One side of a session as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmEndpoint {
    /// URI of the host (nexus) the endpoint lives on.
    pub uri: String,
    pub rpc_id: u8,
    /// Session number at this endpoint.
    pub session_num: u16,
    /// Wire generation of that session (see [`PktHdr`](crate::PktHdr)).
    pub session_gen: u16,
    pub routing_info: RoutingInfo,
}

impl SmEndpoint {
    pub fn new(uri: impl Into<String>, rpc_id: u8) -> Self {
        Self {
            uri: uri.into(),
            rpc_id,
            session_num: 0,
            session_gen: 0,
            routing_info: RoutingInfo::default(),
        }
    }
}

/// A session-management packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err_type: SmErrType,
    /// Identifies one session attempt; retransmissions carry the same token.
    pub uniq_token: u64,
    /// Request window of the session. The server sizes its half from the
    /// client's value, so both sides map request numbers to the same slots.
    pub req_window: usize,
    pub client: SmEndpoint,
    pub server: SmEndpoint,
}

impl SmPkt {
    /// Check if this is a request (client to server).
    #[inline]
    pub fn is_request(&self) -> bool {
        self.pkt_type.is_request()
    }

    /// URI the packet must be delivered to.
    pub fn dest_uri(&self) -> &str {
        if self.is_request() {
            &self.server.uri
        } else {
            &self.client.uri
        }
    }

    /// Rpc id the packet must be delivered to.
    pub fn dest_rpc_id(&self) -> u8 {
        if self.is_request() {
            self.server.rpc_id
        } else {
            self.client.rpc_id
        }
    }

    /// Build the response to this request.
    pub fn to_response(&self, err_type: SmErrType) -> SmPkt {
        debug_assert!(self.is_request());
        SmPkt {
            pkt_type: self.pkt_type.response_type(),
            err_type,
            uniq_token: self.uniq_token,
            req_window: self.req_window,
            client: self.client.clone(),
            server: self.server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_req() -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::ConnectRequest,
            err_type: SmErrType::NoError,
            uniq_token: 7,
            req_window: 8,
            client: SmEndpoint::new("client", 1),
            server: SmEndpoint::new("server", 2),
        }
    }

    #[test]
    fn test_routing_by_direction() {
        let req = connect_req();
        assert_eq!(req.dest_uri(), "server");
        assert_eq!(req.dest_rpc_id(), 2);

        let resp = req.to_response(SmErrType::TooManySessions);
        assert_eq!(resp.pkt_type, SmPktType::ConnectResponse);
        assert_eq!(resp.err_type, SmErrType::TooManySessions);
        assert_eq!(resp.uniq_token, 7);
        assert_eq!(resp.req_window, 8);
        assert_eq!(resp.dest_uri(), "client");
        assert_eq!(resp.dest_rpc_id(), 1);
    }

    #[test]
    fn test_response_types() {
        assert_eq!(
            SmPktType::DisconnectRequest.response_type(),
            SmPktType::DisconnectResponse
        );
        assert!(!SmPktType::DisconnectResponse.is_request());
    }
}
