//! Transport contract consumed by the RPC engine.
//!
//! A transport moves raw packets between endpoints on a best-effort basis:
//! it may drop, reorder or duplicate them. Everything above this trait is
//! built without assuming otherwise.
//!
//! Two implementations are provided:
//!
//! - [`LoopbackTransport`]: in-process fabric with drop/duplicate/reorder
//!   injection, used for tests and benchmarks
//! - [`UdpTransport`]: non-blocking UDP sockets

mod loopback;
mod udp;

pub use loopback::{LoopbackConfig, LoopbackFabric, LoopbackTransport};
pub use udp::UdpTransport;

use std::fmt;

use crate::buffer::{HugeAlloc, RxRing};
use crate::error::Result;
use crate::packet::PKT_HDR_SIZE;

/// Size of the opaque routing-info blob.
pub const ROUTING_INFO_LEN: usize = 48;

/// Opaque, transport-specific addressing blob.
///
/// Filled by the local transport, exchanged through session management and
/// resolved by the remote transport before a session becomes usable.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RoutingInfo {
    pub buf: [u8; ROUTING_INFO_LEN],
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self {
            buf: [0; ROUTING_INFO_LEN],
        }
    }
}

impl fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self
            .buf
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        write!(f, "RoutingInfo(")?;
        for b in &self.buf[..used] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Routing info every transport treats as unresolvable.
pub(crate) static NULL_ROUTING_INFO: RoutingInfo = RoutingInfo {
    buf: [0; ROUTING_INFO_LEN],
};

/// One packet handed to [`Transport::tx_burst`].
///
/// The header and data are views into the sender's own buffers; the
/// transport gathers them at send time.
#[derive(Debug, Clone, Copy)]
pub struct TxBurstItem<'a> {
    pub routing_info: &'a RoutingInfo,
    pub hdr: &'a [u8],
    pub data: &'a [u8],
    /// Drop this packet instead of sending it (fault injection).
    pub drop: bool,
}

impl TxBurstItem<'_> {
    /// Placeholder used to pre-fill burst arrays.
    pub(crate) fn empty() -> Self {
        TxBurstItem {
            routing_info: &NULL_ROUTING_INFO,
            hdr: &[],
            data: &[],
            drop: true,
        }
    }

    /// Total wire length.
    #[inline]
    pub fn len(&self) -> usize {
        self.hdr.len() + self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Packet transport used by an [`Rpc`](crate::Rpc) endpoint.
///
/// All methods are non-blocking.
pub trait Transport {
    /// Maximum packet size in bytes, header included.
    fn mtu(&self) -> usize;

    /// Payload bytes per packet.
    fn max_data_per_pkt(&self) -> usize {
        self.mtu() - PKT_HDR_SIZE
    }

    /// One-time registration of the endpoint's message arena and receive ring.
    fn init_hugepage_structures(&mut self, alloc: &HugeAlloc, ring: &mut RxRing) -> Result<()>;

    /// Write this endpoint's address into `ri`.
    fn fill_local_routing_info(&self, ri: &mut RoutingInfo);

    /// Validate (and possibly rewrite in place) a peer's routing info.
    ///
    /// Returns false if the peer cannot be reached through this transport.
    fn resolve_remote_routing_info(&mut self, ri: &mut RoutingInfo) -> bool;

    /// Best-effort send of a batch of packets.
    fn tx_burst(&mut self, items: &[TxBurstItem<'_>]);

    /// Push out anything `tx_burst` buffered.
    fn tx_flush(&mut self);

    /// Receive up to `ring.max_batch()` packets into the ring's burst slots.
    ///
    /// Returns the number of packets delivered (0 permitted).
    fn rx_burst(&mut self, ring: &mut RxRing) -> usize;

    /// Give `num` consumed ring slots back to the receive path.
    fn post_recvs(&mut self, num: usize);

    /// Human-readable form of routing info, for logs.
    fn routing_info_str(&self, ri: &RoutingInfo) -> String {
        format!("{:?}", ri)
    }
}
