//! Per-endpoint counters.

use std::cell::Cell;

/// Snapshot of an endpoint's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcStats {
    /// Data packets handed to the transport.
    pub pkts_tx: u64,
    /// Data packets received from the transport.
    pub pkts_rx: u64,
    /// Request retransmissions (one per timeout, not per packet).
    pub retransmissions: u64,
    /// Duplicate packets dropped.
    pub dup_pkts_dropped: u64,
    /// Packets dropped by `pkt_drop_prob`.
    pub injected_drops: u64,
    pub sm_pkts_tx: u64,
    pub sm_pkts_rx: u64,
    /// Requests failed with `RequestTimedOut`.
    pub req_timeouts: u64,
}

/// Live counters, bumped by the owning endpoint's thread only.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub pkts_tx: Cell<u64>,
    pub pkts_rx: Cell<u64>,
    pub retransmissions: Cell<u64>,
    pub dup_pkts_dropped: Cell<u64>,
    pub injected_drops: Cell<u64>,
    pub sm_pkts_tx: Cell<u64>,
    pub sm_pkts_rx: Cell<u64>,
    pub req_timeouts: Cell<u64>,
}

#[inline]
pub(crate) fn bump(c: &Cell<u64>, n: u64) {
    c.set(c.get() + n);
}

impl StatsCounters {
    pub fn snapshot(&self) -> RpcStats {
        RpcStats {
            pkts_tx: self.pkts_tx.get(),
            pkts_rx: self.pkts_rx.get(),
            retransmissions: self.retransmissions.get(),
            dup_pkts_dropped: self.dup_pkts_dropped.get(),
            injected_drops: self.injected_drops.get(),
            sm_pkts_tx: self.sm_pkts_tx.get(),
            sm_pkts_rx: self.sm_pkts_rx.get(),
            req_timeouts: self.req_timeouts.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = StatsCounters::default();
        bump(&stats.pkts_tx, 3);
        bump(&stats.req_timeouts, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.pkts_tx, 3);
        assert_eq!(snap.req_timeouts, 1);
        assert_eq!(snap.pkts_rx, 0);
    }
}
