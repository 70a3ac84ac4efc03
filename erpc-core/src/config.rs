//! Configuration types for erpc-core.

use crate::error::{Error, Result};

/// RPC endpoint configuration.
///
/// Controls request multiplexing, retransmission, session management and
/// memory sizing of an [`Rpc`](crate::Rpc) endpoint.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size (number of concurrent requests per session).
    /// This is also the per-session credit window.
    /// Default: 8
    pub req_window: usize,
    /// Maximum number of sessions (client and server) per endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// Request retransmission timeout in microseconds.
    /// Default: 5000 (5ms)
    pub rto_us: u64,
    /// Maximum number of request retransmissions before the request fails.
    /// Default: 5
    pub max_retries: u32,
    /// Initial session-management retransmission timeout in microseconds.
    /// Doubled on every retry.
    /// Default: 20000 (20ms)
    pub sm_rto_us: u64,
    /// Maximum number of session-management retransmissions.
    /// Default: 5
    pub sm_max_retries: u32,
    /// Size of the pinned MsgBuffer arena in bytes.
    /// Default: 16 MiB
    pub arena_size: usize,
    /// Largest request or response message in bytes.
    /// Default: 8 MiB
    pub max_msg_size: usize,
    /// Number of entries in the transport receive ring.
    /// Default: 512
    pub num_rx_ring_entries: usize,
    /// Maximum packets pulled from the transport per event loop iteration.
    /// Default: 16
    pub rx_batch: usize,
    /// Probability that a data packet sent by this endpoint is dropped.
    /// Only meant for fault injection in tests.
    /// Default: 0.0
    pub pkt_drop_prob: f64,
    /// Seed for the fault-injection RNG. `None` seeds from entropy.
    /// Default: None
    pub fault_seed: Option<u64>,
    /// Try to `mlock` the arena and receive ring.
    /// Default: true
    pub pin_memory: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            max_sessions: 256,
            rto_us: 5000,
            max_retries: 5,
            sm_rto_us: 20_000,
            sm_max_retries: 5,
            arena_size: 16 << 20,
            max_msg_size: 8 << 20,
            num_rx_ring_entries: 512,
            rx_batch: 16,
            pkt_drop_prob: 0.0,
            fault_seed: None,
            pin_memory: true,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        self.req_window = req_window;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the retransmission timeout.
    pub fn with_rto_us(mut self, rto_us: u64) -> Self {
        self.rto_us = rto_us;
        self
    }

    /// Set the maximum retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial session-management timeout.
    pub fn with_sm_rto_us(mut self, sm_rto_us: u64) -> Self {
        self.sm_rto_us = sm_rto_us;
        self
    }

    /// Set the maximum session-management retries.
    pub fn with_sm_max_retries(mut self, sm_max_retries: u32) -> Self {
        self.sm_max_retries = sm_max_retries;
        self
    }

    /// Set the arena size.
    pub fn with_arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the number of receive ring entries.
    pub fn with_num_rx_ring_entries(mut self, num_rx_ring_entries: usize) -> Self {
        self.num_rx_ring_entries = num_rx_ring_entries;
        self
    }

    /// Set the receive batch size.
    pub fn with_rx_batch(mut self, rx_batch: usize) -> Self {
        self.rx_batch = rx_batch;
        self
    }

    /// Set the packet drop probability.
    pub fn with_pkt_drop_prob(mut self, pkt_drop_prob: f64) -> Self {
        self.pkt_drop_prob = pkt_drop_prob;
        self
    }

    /// Set the fault-injection seed.
    pub fn with_fault_seed(mut self, seed: u64) -> Self {
        self.fault_seed = Some(seed);
        self
    }

    /// Enable or disable memory pinning.
    pub fn with_pin_memory(mut self, pin_memory: bool) -> Self {
        self.pin_memory = pin_memory;
        self
    }

    /// Check the configuration for impossible combinations.
    pub fn validate(&self) -> Result<()> {
        if self.req_window == 0 || self.req_window > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "req_window must be in 1..={}, got {}",
                u16::MAX,
                self.req_window
            )));
        }
        // u16::MAX is reserved for SessionHandle::NULL.
        if self.max_sessions == 0 || self.max_sessions >= u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be in 1..{}, got {}",
                u16::MAX,
                self.max_sessions
            )));
        }
        if self.rto_us == 0 || self.sm_rto_us == 0 {
            return Err(Error::InvalidConfig("timeouts cannot be 0".into()));
        }
        if self.num_rx_ring_entries == 0 || self.rx_batch == 0 {
            return Err(Error::InvalidConfig("receive ring cannot be empty".into()));
        }
        if self.rx_batch > self.num_rx_ring_entries {
            return Err(Error::InvalidConfig(format!(
                "rx_batch ({}) exceeds num_rx_ring_entries ({})",
                self.rx_batch, self.num_rx_ring_entries
            )));
        }
        if self.max_msg_size == 0 || self.max_msg_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_msg_size must be in 1..={}, got {}",
                u32::MAX,
                self.max_msg_size
            )));
        }
        if self.arena_size == 0 {
            return Err(Error::InvalidConfig("arena_size cannot be 0".into()));
        }
        if !(0.0..=1.0).contains(&self.pkt_drop_prob) {
            return Err(Error::InvalidConfig(format!(
                "pkt_drop_prob must be in [0, 1], got {}",
                self.pkt_drop_prob
            )));
        }
        Ok(())
    }
}
