//! Credit-based flow control for erpc-core.
//!
//! Each session owns `req_window` request slots. A credit is a free slot: a
//! request takes one when enqueued and gives it back when its continuation
//! runs. With no free slot the session pushes back instead of queueing.

/// Per-session credit window.
#[derive(Debug, Clone)]
pub struct CreditWindow {
    /// Free slot indices (stack).
    free: Vec<usize>,
    /// Window size.
    window: usize,
}

impl CreditWindow {
    /// Create a window with all `window` slots free.
    pub fn new(window: usize) -> Self {
        Self {
            free: (0..window).rev().collect(),
            window,
        }
    }

    /// Take a credit, returning the slot index it stands for.
    #[inline]
    pub fn try_acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Return the credit for `slot`.
    #[inline]
    pub fn release(&mut self, slot: usize) {
        debug_assert!(slot < self.window);
        debug_assert!(!self.free.contains(&slot));
        self.free.push(slot);
    }

    /// Get the number of available credits.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Get the number of requests in flight.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.window - self.free.len()
    }

    /// Check if no request is in flight.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.free.len() == self.window
    }

    /// Window size.
    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }
}
