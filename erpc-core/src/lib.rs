//! # erpc-core - Session and message-delivery engine for datacenter RPCs
//!
//! This crate implements the eRPC (NSDI 2019) session layer over a pluggable
//! unreliable packet transport: connection handshakes, request/response
//! matching, packetization and reassembly, retransmission and credit-based
//! flow control.
//!
//! ## Features
//!
//! - **Pluggable transport**: in-process loopback fabric with fault injection, and UDP
//! - **Request multiplexing**: up to `req_window` outstanding requests per session
//! - **Credit-based flow control**: requests beyond the window fail with backpressure
//! - **At-most-once execution**: retransmitted requests never re-run the handler
//! - **Multi-packet messages**: reassembly tolerant to reordering and duplication
//!
//! ## Usage
//!
//! ```ignore
//! use erpc_core::{LoopbackConfig, LoopbackFabric, LoopbackTransport, Nexus, Rpc, RpcConfig};
//!
//! let nexus = Nexus::new("host-a");
//! let fabric = LoopbackFabric::new();
//!
//! // Server endpoint
//! let server: Rpc<(), _> = Rpc::new(
//!     &nexus,
//!     1,
//!     LoopbackTransport::new(&fabric, LoopbackConfig::default())?,
//!     RpcConfig::default(),
//! )?;
//! server.register_req_func(7, |rpc, req| {
//!     let _ = req.respond(rpc, b"pong");
//! })?;
//!
//! // Client endpoint
//! let client: Rpc<u64, _> = Rpc::new(
//!     &nexus,
//!     2,
//!     LoopbackTransport::new(&fabric, LoopbackConfig::default())?,
//!     RpcConfig::default(),
//! )?;
//! let session = client.create_session("host-a", 1)?;
//! while !client.is_connected(session) {
//!     client.run_event_loop_once();
//!     server.run_event_loop_once();
//! }
//!
//! let req = client.alloc_msg_buffer(4)?;
//! client.write_msg(&req, b"ping")?;
//! let resp = client.alloc_msg_buffer(4)?;
//! client
//!     .enqueue_request(session, 7, req, resp, |rpc, c| {
//!         println!("{:?}", &*rpc.msg_data(&c.resp).unwrap());
//!     }, 0)
//!     .map_err(|e| e.error)?;
//!
//! loop {
//!     client.run_event_loop_once();
//!     server.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: Endpoint configuration (`RpcConfig`)
//! - [`packet`]: Data packet header format (`PktHdr`)
//! - [`buffer`]: MsgBuffer arena and receive ring (`HugeAlloc`, `RxRing`)
//! - [`transport`]: Transport trait, loopback fabric and UDP
//! - [`nexus`]: Per-process session-management fabric (`Nexus`)
//! - [`sm`]: Session-management packets and events
//! - [`session`]: Sessions, slots and the session table
//! - [`reliability`]: Packet tracking and retry budgets
//! - [`flow_control`]: Per-session credit window
//! - [`timing`]: Timing wheel for retransmission timeouts
//! - [`stats`]: Endpoint counters
//! - [`rpc`]: Main RPC API (`Rpc`)
//!
//! ## References
//!
//! - [eRPC: General-Purpose RPCs for the Datacenter (NSDI 2019)](https://www.usenix.org/conference/nsdi19/presentation/kalia)

pub mod buffer;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod nexus;
pub mod packet;
pub mod reliability;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod stats;
pub mod timing;
pub mod transport;

// Re-export main types
pub use buffer::{HugeAlloc, MsgBuffer, RxRing};
pub use config::RpcConfig;
pub use error::{EnqueueError, Error, Result};
pub use nexus::Nexus;
pub use packet::{PKT_HDR_SIZE, PktHdr, PktType};
pub use rpc::{Completion, Continuation, DeferredReq, ReqFunc, ReqHandle, Rpc, SmHandler};
pub use session::{SessionHandle, SessionState};
pub use sm::{SmErrType, SmEventType};
pub use stats::RpcStats;
pub use transport::{
    LoopbackConfig, LoopbackFabric, LoopbackTransport, RoutingInfo, Transport, UdpTransport,
};
