//! Credit-based flow control windows.
//!
//! A [`FlowControlWindow`] is used for one scope (a single stream or the
//! whole session) in one direction. On the send side the session reserves
//! credit before encoding body bytes and the peer returns credit with window
//! updates. On the receive side the peer's body bytes are reserved as they
//! arrive, released as the application processes them, and returned to the
//! peer once half the window has been consumed.

/// Largest legal window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Default initial window for protocols with flow control.
pub const DEFAULT_WINDOW_SIZE: u32 = 65535;

/// Flow control accounting failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowControlError {
    #[error("window exhausted: requested {requested}, available {available}")]
    Exhausted { requested: u32, available: i64 },
    #[error("window would grow to {window}, above the 2^31-1 maximum")]
    Overflow { window: i64 },
}

/// Flow control state for one scope.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Current window; negative only after the capacity shrinks.
    window: i64,
    /// Configured window size.
    capacity: u32,
    /// Receive side: bytes processed but not yet returned to the peer.
    pending_update: u32,
}

impl FlowControlWindow {
    /// Create a window with `capacity` bytes of credit.
    pub fn new(capacity: u32) -> Self {
        Self {
            window: i64::from(capacity),
            capacity,
            pending_update: 0,
        }
    }

    /// Current window, which may be negative.
    pub fn available(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now (never negative).
    pub fn sendable(&self) -> u32 {
        self.window.clamp(0, i64::from(MAX_WINDOW_SIZE)) as u32
    }

    /// Configured window size.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// True when no credit is left.
    pub fn is_blocked(&self) -> bool {
        self.window <= 0
    }

    /// Take `amount` bytes of credit.
    ///
    /// Fails without modifying the window if it would go negative.
    pub fn reserve(&mut self, amount: u32) -> Result<(), FlowControlError> {
        if i64::from(amount) > self.window {
            return Err(FlowControlError::Exhausted {
                requested: amount,
                available: self.window,
            });
        }
        self.window -= i64::from(amount);
        Ok(())
    }

    /// Return `amount` bytes of credit (window update from the peer).
    pub fn increase(&mut self, amount: u32) -> Result<(), FlowControlError> {
        let window = self.window + i64::from(amount);
        if window > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowControlError::Overflow { window });
        }
        self.window = window;
        Ok(())
    }

    /// Change the configured size, shifting the current window by the delta.
    ///
    /// The result may be negative; sending stays blocked until window
    /// updates bring it back above zero.
    pub fn set_capacity(&mut self, capacity: u32) -> Result<(), FlowControlError> {
        let delta = i64::from(capacity) - i64::from(self.capacity);
        let window = self.window + delta;
        if window > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowControlError::Overflow { window });
        }
        self.window = window;
        self.capacity = capacity;
        Ok(())
    }

    /// Receive side: `amount` reserved bytes were consumed by the application.
    pub fn release(&mut self, amount: u32) {
        self.pending_update = self.pending_update.saturating_add(amount);
    }

    /// Receive side: credit to announce to the peer, once at least half the
    /// window has been released.
    pub fn take_update(&mut self) -> Option<u32> {
        if self.pending_update == 0 || self.pending_update < self.capacity / 2 {
            return None;
        }
        let update = self.pending_update;
        self.pending_update = 0;
        self.window += i64::from(update);
        Some(update)
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
