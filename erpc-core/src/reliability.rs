//! Reliability mechanisms for erpc-core.
//!
//! Packets of one message may arrive in any order and any number of times.
//! [`PktTracker`] records which packet indices of a message have been seen so
//! duplicates are dropped and completion is detected exactly once.
//! [`RetryState`] bounds retransmissions of requests and handshake packets.

/// Received-packet bitmap for one message.
#[derive(Debug, Clone, Default)]
pub struct PktTracker {
    /// One bit per packet index.
    bitmap: Vec<u64>,
    /// Number of packets in the message.
    num_pkts: u16,
    /// Number of distinct packets received.
    received: u16,
}

impl PktTracker {
    /// Create an empty tracker. Call [`reset`](Self::reset) before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a message of `num_pkts` packets.
    ///
    /// Reuses the bitmap allocation, so steady-state resets do not allocate.
    pub fn reset(&mut self, num_pkts: u16) {
        let words = (num_pkts as usize).div_ceil(64);
        self.bitmap.clear();
        self.bitmap.resize(words, 0);
        self.num_pkts = num_pkts;
        self.received = 0;
    }

    /// Stop tracking.
    pub fn clear(&mut self) {
        self.bitmap.clear();
        self.num_pkts = 0;
        self.received = 0;
    }

    /// Check if a message is being tracked.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.num_pkts > 0
    }

    /// Number of packets in the tracked message.
    #[inline]
    pub fn num_pkts(&self) -> u16 {
        self.num_pkts
    }

    /// Number of distinct packets received.
    #[inline]
    pub fn received(&self) -> u16 {
        self.received
    }

    /// Check if packet `pkt_num` was already received.
    #[inline]
    pub fn has(&self, pkt_num: u16) -> bool {
        if pkt_num >= self.num_pkts {
            return false;
        }
        let (word, bit) = (pkt_num as usize / 64, pkt_num as usize % 64);
        self.bitmap[word] & (1u64 << bit) != 0
    }

    /// Record a received packet.
    ///
    /// Returns true if this is a new packet (not a duplicate and in range).
    pub fn record(&mut self, pkt_num: u16) -> bool {
        if pkt_num >= self.num_pkts {
            return false;
        }
        let (word, bit) = (pkt_num as usize / 64, pkt_num as usize % 64);
        let mask = 1u64 << bit;
        if self.bitmap[word] & mask != 0 {
            return false; // Duplicate
        }
        self.bitmap[word] |= mask;
        self.received += 1;
        true
    }

    /// Check if every packet has been received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.num_pkts > 0 && self.received == self.num_pkts
    }
}

/// What to do when a retransmission timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send again and re-arm the timer.
    Retransmit,
    /// The retry budget is spent.
    GiveUp,
}

/// Retry budget for one request or handshake.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    retries: u32,
    max_retries: u32,
}

impl RetryState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retries: 0,
            max_retries,
        }
    }

    /// Start a fresh budget.
    #[inline]
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Number of retransmissions so far.
    #[inline]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Account for an expired timer.
    pub fn on_timeout(&mut self) -> RetryDecision {
        if self.retries >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        self.retries += 1;
        RetryDecision::Retransmit
    }
}

/// Exponential backoff: `base_us * 2^attempt`, with the shift capped at 16.
#[inline]
pub fn backoff_us(base_us: u64, attempt: u32) -> u64 {
    base_us.saturating_mul(1u64 << attempt.min(16))
}
