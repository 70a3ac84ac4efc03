//! UDP socket transport.
//!
//! Routing info is an IPv4 address and a UDP port. Received datagrams land
//! directly in the receive ring; sends gather header and data with one
//! `sendmsg` so the message buffer is only copied at the OS boundary.

use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{SockAddr, SockRef};
use tracing::{debug, trace, warn};

use super::{RoutingInfo, Transport, TxBurstItem};
use crate::buffer::{HugeAlloc, RxRing};
use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;

/// Default MTU of the UDP transport.
pub const UDP_MTU: usize = 1024;

/// Non-blocking UDP transport.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddrV4,
    mtu: usize,
}

impl UdpTransport {
    /// Bind to `addr`. An unspecified IP is advertised as 127.0.0.1; port 0
    /// picks an ephemeral port.
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        Self::bind_with_mtu(addr, UDP_MTU)
    }

    /// Bind with a custom MTU.
    pub fn bind_with_mtu(addr: SocketAddrV4, mtu: usize) -> Result<Self> {
        if mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig(format!(
                "UDP MTU {} does not fit a packet header",
                mtu
            )));
        }
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let SocketAddr::V4(bound) = socket.local_addr()? else {
            return Err(Error::InvalidConfig("UDP transport requires IPv4".into()));
        };
        let ip = if bound.ip().is_unspecified() {
            Ipv4Addr::LOCALHOST
        } else {
            *bound.ip()
        };
        let local = SocketAddrV4::new(ip, bound.port());
        debug!(%local, mtu, "UDP transport bound");
        Ok(Self { socket, local, mtu })
    }

    /// Address advertised to peers.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    fn decode(ri: &RoutingInfo) -> SocketAddrV4 {
        let ip = Ipv4Addr::new(ri.buf[0], ri.buf[1], ri.buf[2], ri.buf[3]);
        let port = u16::from_le_bytes([ri.buf[4], ri.buf[5]]);
        SocketAddrV4::new(ip, port)
    }

    fn encode(addr: SocketAddrV4, ri: &mut RoutingInfo) {
        *ri = RoutingInfo::default();
        ri.buf[0..4].copy_from_slice(&addr.ip().octets());
        ri.buf[4..6].copy_from_slice(&addr.port().to_le_bytes());
    }
}

impl Transport for UdpTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn init_hugepage_structures(&mut self, _alloc: &HugeAlloc, ring: &mut RxRing) -> Result<()> {
        if ring.slot_size() < self.mtu {
            return Err(Error::InvalidConfig(format!(
                "receive ring slot ({} bytes) smaller than MTU ({})",
                ring.slot_size(),
                self.mtu
            )));
        }
        Ok(())
    }

    fn fill_local_routing_info(&self, ri: &mut RoutingInfo) {
        Self::encode(self.local, ri);
    }

    fn resolve_remote_routing_info(&mut self, ri: &mut RoutingInfo) -> bool {
        let addr = Self::decode(ri);
        !addr.ip().is_unspecified() && addr.port() != 0
    }

    fn tx_burst(&mut self, items: &[TxBurstItem<'_>]) {
        let sock = SockRef::from(&self.socket);
        for item in items {
            if item.drop {
                continue;
            }
            let dest = SockAddr::from(Self::decode(item.routing_info));
            let bufs = [IoSlice::new(item.hdr), IoSlice::new(item.data)];
            match sock.send_to_vectored(&bufs, &dest) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!("UDP send buffer full, dropping packet");
                }
                Err(e) => warn!(error = %e, "UDP send failed"),
            }
        }
    }

    fn tx_flush(&mut self) {}

    fn rx_burst(&mut self, ring: &mut RxRing) -> usize {
        let mut n = 0;
        while n < ring.max_batch() {
            match self.socket.recv_from(ring.batch_slot_mut(n)) {
                Ok((len, _)) => {
                    ring.set_batch_len(n, len);
                    n += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
        n
    }

    fn post_recvs(&mut self, _num: usize) {}

    fn routing_info_str(&self, ri: &RoutingInfo) -> String {
        format!("[UDP {}]", Self::decode(ri))
    }
}
