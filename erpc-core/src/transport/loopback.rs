//! In-process loopback transport.
//!
//! Endpoints attach to a shared [`LoopbackFabric`] and get a port. Each port
//! has a packet queue behind its own lock; senders push into the peer's
//! queue and the owner drains its queue into the receive ring. The lock is
//! held only for the push or the drain, never while the engine processes
//! packets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use tracing::trace;

use super::{RoutingInfo, Transport, TxBurstItem};
use crate::buffer::{HugeAlloc, RxRing};
use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;

/// Default MTU of the loopback transport.
pub const LOOPBACK_MTU: usize = 1024;

/// Packets a port queue holds before new arrivals are dropped.
pub const LOOPBACK_QUEUE_DEPTH: usize = 8192;

static NEXT_FABRIC_ID: AtomicU64 = AtomicU64::new(1);

type PortQueue = Arc<Mutex<VecDeque<Box<[u8]>>>>;

/// Loopback transport configuration.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Maximum packet size, header included.
    /// Default: 1024
    pub mtu: usize,
    /// Probability that a packet is lost.
    /// Default: 0.0
    pub drop_prob: f64,
    /// Probability that a packet is delivered twice.
    /// Default: 0.0
    pub dup_prob: f64,
    /// Probability that a packet is queued at a random position instead of
    /// at the tail.
    /// Default: 0.0
    pub reorder_prob: f64,
    /// RNG seed. `None` seeds from entropy.
    /// Default: None
    pub seed: Option<u64>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            mtu: LOOPBACK_MTU,
            drop_prob: 0.0,
            dup_prob: 0.0,
            reorder_prob: 0.0,
            seed: None,
        }
    }
}

impl LoopbackConfig {
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_drop_prob(mut self, p: f64) -> Self {
        self.drop_prob = p;
        self
    }

    pub fn with_dup_prob(mut self, p: f64) -> Self {
        self.dup_prob = p;
        self
    }

    pub fn with_reorder_prob(mut self, p: f64) -> Self {
        self.reorder_prob = p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Shared medium connecting loopback transports.
pub struct LoopbackFabric {
    id: u64,
    ports: Mutex<Slab<PortQueue>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FABRIC_ID.fetch_add(1, Ordering::Relaxed),
            ports: Mutex::new(Slab::new()),
        })
    }

    /// Number of attached transports.
    pub fn num_ports(&self) -> usize {
        self.ports.lock().len()
    }

    /// Port numbers are slab keys + 1 so that 0 stays invalid.
    fn attach(&self) -> (u16, PortQueue) {
        let queue: PortQueue = Arc::new(Mutex::new(VecDeque::new()));
        let key = self.ports.lock().insert(queue.clone());
        ((key + 1) as u16, queue)
    }

    fn detach(&self, port: u16) {
        let mut ports = self.ports.lock();
        let key = port as usize - 1;
        if ports.contains(key) {
            ports.remove(key);
        }
    }

    fn lookup(&self, port: u16) -> Option<PortQueue> {
        if port == 0 {
            return None;
        }
        self.ports.lock().get(port as usize - 1).cloned()
    }
}

/// Loopback transport over a [`LoopbackFabric`].
pub struct LoopbackTransport {
    fabric: Arc<LoopbackFabric>,
    port: u16,
    rx_queue: PortQueue,
    /// Resolved peers.
    peers: HashMap<u16, PortQueue>,
    config: LoopbackConfig,
    rng: StdRng,
}

impl LoopbackTransport {
    /// Attach a new transport to `fabric`.
    pub fn new(fabric: &Arc<LoopbackFabric>, config: LoopbackConfig) -> Result<Self> {
        if config.mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig(format!(
                "loopback MTU {} does not fit a packet header",
                config.mtu
            )));
        }
        for p in [config.drop_prob, config.dup_prob, config.reorder_prob] {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!(
                    "fault probability must be in [0, 1], got {}",
                    p
                )));
            }
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (port, rx_queue) = fabric.attach();
        Ok(Self {
            fabric: fabric.clone(),
            port,
            rx_queue,
            peers: HashMap::new(),
            config,
            rng,
        })
    }

    /// Port of this transport on its fabric.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn decode(ri: &RoutingInfo) -> (u64, u16) {
        let mut id = [0u8; 8];
        id.copy_from_slice(&ri.buf[0..8]);
        (
            u64::from_le_bytes(id),
            u16::from_le_bytes([ri.buf[8], ri.buf[9]]),
        )
    }

    fn push(&mut self, queue: &PortQueue, pkt: Box<[u8]>) {
        let reorder = self.config.reorder_prob > 0.0 && self.rng.gen_bool(self.config.reorder_prob);
        let mut q = queue.lock();
        if q.len() >= LOOPBACK_QUEUE_DEPTH {
            trace!(port = self.port, "loopback queue full, dropping packet");
            return;
        }
        if reorder {
            let pos = self.rng.gen_range(0..=q.len());
            q.insert(pos, pkt);
        } else {
            q.push_back(pkt);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.fabric.detach(self.port);
    }
}

impl Transport for LoopbackTransport {
    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn init_hugepage_structures(&mut self, _alloc: &HugeAlloc, ring: &mut RxRing) -> Result<()> {
        if ring.slot_size() < self.config.mtu {
            return Err(Error::InvalidConfig(format!(
                "receive ring slot ({} bytes) smaller than MTU ({})",
                ring.slot_size(),
                self.config.mtu
            )));
        }
        Ok(())
    }

    fn fill_local_routing_info(&self, ri: &mut RoutingInfo) {
        *ri = RoutingInfo::default();
        ri.buf[0..8].copy_from_slice(&self.fabric.id.to_le_bytes());
        ri.buf[8..10].copy_from_slice(&self.port.to_le_bytes());
    }

    fn resolve_remote_routing_info(&mut self, ri: &mut RoutingInfo) -> bool {
        let (fabric_id, port) = Self::decode(ri);
        if fabric_id != self.fabric.id {
            return false;
        }
        match self.fabric.lookup(port) {
            Some(queue) => {
                self.peers.insert(port, queue);
                true
            }
            None => false,
        }
    }

    fn tx_burst(&mut self, items: &[TxBurstItem<'_>]) {
        for item in items {
            if item.drop {
                continue;
            }
            if self.config.drop_prob > 0.0 && self.rng.gen_bool(self.config.drop_prob) {
                continue;
            }
            let (_, port) = Self::decode(item.routing_info);
            let Some(queue) = self.peers.get(&port).cloned() else {
                trace!(port, "loopback send to unresolved port");
                continue;
            };

            let mut pkt = Vec::with_capacity(item.len());
            pkt.extend_from_slice(item.hdr);
            pkt.extend_from_slice(item.data);
            let pkt = pkt.into_boxed_slice();

            if self.config.dup_prob > 0.0 && self.rng.gen_bool(self.config.dup_prob) {
                self.push(&queue, pkt.clone());
            }
            self.push(&queue, pkt);
        }
    }

    fn tx_flush(&mut self) {}

    fn rx_burst(&mut self, ring: &mut RxRing) -> usize {
        let mut q = self.rx_queue.lock();
        let n = q.len().min(ring.max_batch());
        for k in 0..n {
            let Some(pkt) = q.pop_front() else { return k };
            let len = pkt.len().min(ring.slot_size());
            ring.batch_slot_mut(k)[..len].copy_from_slice(&pkt[..len]);
            ring.set_batch_len(k, len);
        }
        n
    }

    fn post_recvs(&mut self, _num: usize) {}

    fn routing_info_str(&self, ri: &RoutingInfo) -> String {
        let (fabric_id, port) = Self::decode(ri);
        format!("[fabric {}, port {}]", fabric_id, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> RxRing {
        RxRing::new(16, LOOPBACK_MTU, 8, false).unwrap()
    }

    fn connect(a: &mut LoopbackTransport, b: &LoopbackTransport) -> RoutingInfo {
        let mut ri = RoutingInfo::default();
        b.fill_local_routing_info(&mut ri);
        assert!(a.resolve_remote_routing_info(&mut ri));
        ri
    }

    #[test]
    fn test_send_recv() {
        let fabric = LoopbackFabric::new();
        let mut a = LoopbackTransport::new(&fabric, LoopbackConfig::default()).unwrap();
        let mut b = LoopbackTransport::new(&fabric, LoopbackConfig::default()).unwrap();
        let ri = connect(&mut a, &b);

        let hdr = [1u8; PKT_HDR_SIZE];
        let item = TxBurstItem {
            routing_info: &ri,
            hdr: &hdr,
            data: b"hello",
            drop: false,
        };
        a.tx_burst(&[item, TxBurstItem { drop: true, ..item }]);

        let mut ring = ring();
        assert_eq!(b.rx_burst(&mut ring), 1);
        let pkt = ring.batch_pkt(0);
        assert_eq!(&pkt[..PKT_HDR_SIZE], &hdr);
        assert_eq!(&pkt[PKT_HDR_SIZE..], b"hello");
        ring.advance(1);
        assert_eq!(b.rx_burst(&mut ring), 0);
    }

    #[test]
    fn test_resolve_rejects_foreign_fabric() {
        let f1 = LoopbackFabric::new();
        let f2 = LoopbackFabric::new();
        let mut a = LoopbackTransport::new(&f1, LoopbackConfig::default()).unwrap();
        let b = LoopbackTransport::new(&f2, LoopbackConfig::default()).unwrap();

        let mut ri = RoutingInfo::default();
        b.fill_local_routing_info(&mut ri);
        assert!(!a.resolve_remote_routing_info(&mut ri));
        assert!(!a.resolve_remote_routing_info(&mut RoutingInfo::default()));
    }

    #[test]
    fn test_detach_on_drop() {
        let fabric = LoopbackFabric::new();
        let mut a = LoopbackTransport::new(&fabric, LoopbackConfig::default()).unwrap();
        let b = LoopbackTransport::new(&fabric, LoopbackConfig::default()).unwrap();
        let mut ri = RoutingInfo::default();
        b.fill_local_routing_info(&mut ri);
        drop(b);
        assert_eq!(fabric.num_ports(), 1);
        assert!(!a.resolve_remote_routing_info(&mut ri));
    }

    #[test]
    fn test_fault_injection() {
        let fabric = LoopbackFabric::new();
        let mut a = LoopbackTransport::new(
            &fabric,
            LoopbackConfig::default().with_dup_prob(1.0).with_seed(1),
        )
        .unwrap();
        let mut b = LoopbackTransport::new(&fabric, LoopbackConfig::default()).unwrap();
        let ri = connect(&mut a, &b);
        let item = TxBurstItem {
            routing_info: &ri,
            hdr: &[0u8; PKT_HDR_SIZE],
            data: &[],
            drop: false,
        };
        a.tx_burst(&[item]);
        let mut ring = ring();
        assert_eq!(b.rx_burst(&mut ring), 2);

        let mut lossy = LoopbackTransport::new(
            &fabric,
            LoopbackConfig::default().with_drop_prob(1.0).with_seed(1),
        )
        .unwrap();
        let ri = connect(&mut lossy, &b);
        lossy.tx_burst(&[TxBurstItem {
            routing_info: &ri,
            ..item
        }]);
        ring.advance(2);
        assert_eq!(b.rx_burst(&mut ring), 0);
    }
}
