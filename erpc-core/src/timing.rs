//! Timing wheel for retransmission timeouts.
//!
//! The wheel provides O(1) insertion. Timers are never cancelled: when one
//! fires, its owner checks whether the entry still matches live state and
//! ignores it otherwise.

use std::sync::OnceLock;
use std::time::Instant;

/// What a timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A data-plane request awaiting its response.
    Request,
    /// A connect or disconnect handshake awaiting its response.
    SessionMgmt,
}

/// Entry in the timing wheel.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub kind: TimerKind,
    /// Session number.
    pub session_num: u16,
    /// Session generation, to ignore timers of recycled session numbers.
    pub generation: u32,
    /// SSlot index (requests only).
    pub sslot_idx: usize,
    /// Request number, or handshake attempt for SM timers.
    pub seq: u64,
    /// Expiration timestamp (microseconds).
    pub expires_at: u64,
}

/// Timing wheel for managing retransmission timeouts.
///
/// Time is divided into ticks of `slot_duration_us`; a timer lives in the
/// slot of the tick it expires in. Timers further out than one revolution
/// park in the farthest slot and are re-filed when that slot is drained.
pub struct TimingWheel {
    /// Wheel slots, each containing timers expiring in that slot.
    slots: Vec<Vec<TimerEntry>>,
    /// Duration of each slot in microseconds.
    slot_duration_us: u64,
    /// Tick of the last advance.
    cur_tick: u64,
    /// Scratch space for draining a slot without allocating.
    scratch: Vec<TimerEntry>,
    /// Entries drained but not yet expired.
    refile: Vec<TimerEntry>,
    len: usize,
}

impl TimingWheel {
    /// Create a new timing wheel.
    ///
    /// # Arguments
    /// * `num_slots` - Number of slots in the wheel
    /// * `slot_duration_us` - Duration of each slot in microseconds
    pub fn new(num_slots: usize, slot_duration_us: u64) -> Self {
        let num_slots = num_slots.max(2);
        Self {
            slots: (0..num_slots).map(|_| Vec::new()).collect(),
            slot_duration_us: slot_duration_us.max(1),
            cur_tick: 0,
            scratch: Vec::new(),
            refile: Vec::new(),
            len: 0,
        }
    }

    /// Create a timing wheel with default parameters suitable for RTO tracking.
    ///
    /// Default: 256 slots, 100us per slot = 25.6ms per revolution
    pub fn default_for_rpc() -> Self {
        Self::new(256, 100)
    }

    /// Initialize the wheel with a starting timestamp.
    pub fn init(&mut self, ts: u64) {
        self.cur_tick = ts / self.slot_duration_us;
    }

    #[inline]
    fn num_slots(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Insert a timer entry.
    ///
    /// Entries that are already due are filed in the current slot and fire
    /// on the next advance.
    pub fn insert(&mut self, entry: TimerEntry) {
        let tick = (entry.expires_at / self.slot_duration_us).max(self.cur_tick);
        let tick = tick.min(self.cur_tick + self.num_slots() - 1);
        let slot = (tick % self.num_slots()) as usize;
        self.slots[slot].push(entry);
        self.len += 1;
    }

    /// Advance the wheel to `now`, pushing expired entries into `out`.
    ///
    /// An entry is reported only once `expires_at <= now`, never earlier.
    /// The buffer is NOT cleared; caller should clear it before calling if needed.
    pub fn advance_into(&mut self, now: u64, out: &mut Vec<TimerEntry>) {
        let now_tick = now / self.slot_duration_us;
        if now_tick < self.cur_tick {
            return;
        }
        let span = (now_tick - self.cur_tick + 1).min(self.num_slots());

        let mut scratch = std::mem::take(&mut self.scratch);
        for i in 0..span {
            let slot = ((self.cur_tick + i) % self.num_slots()) as usize;
            std::mem::swap(&mut self.slots[slot], &mut scratch);
            for entry in scratch.drain(..) {
                if entry.expires_at <= now {
                    out.push(entry);
                    self.len -= 1;
                } else {
                    self.refile.push(entry);
                }
            }
        }
        self.scratch = scratch;
        self.cur_tick = now_tick;

        let mut refile = std::mem::take(&mut self.refile);
        for entry in refile.drain(..) {
            self.len -= 1;
            self.insert(entry);
        }
        self.refile = refile;
    }

    /// Advance the wheel to `now`, returning expired entries.
    pub fn advance(&mut self, now: u64) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        self.advance_into(now, &mut expired);
        expired
    }

    /// Get the number of pending timers.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.len
    }

    /// Check if the wheel is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Get a monotonic timestamp in microseconds.
#[inline]
pub fn current_time_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
