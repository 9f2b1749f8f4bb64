//! Per-peer byte budget for outgoing buffers.
//!
//! Bytes are added at the configured rate up to `rate × burst seconds`. A
//! flush may go ahead whenever the budget is positive and is then charged in
//! full, so one oversized flush delays the following ones instead of
//! blocking forever.

use crate::wrapping_number::wrapping_diff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendLimit {
    /// Bytes per second; 0 is unlimited
    pub bytes_per_sec: u32,
    /// Seconds of unused budget that may accumulate
    pub burst_sec: f32,
}

impl SendLimit {
    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    fn capacity(&self) -> f64 {
        f64::from(self.bytes_per_sec) * f64::from(self.burst_sec)
    }
}

#[derive(Debug)]
pub struct SendAllowance {
    /// Bytes that may be sent now. Negative after an oversized flush.
    available: f64,
    last_refill: Option<u32>,
}

impl SendAllowance {
    pub fn new() -> Self {
        Self {
            available: 0.0,
            last_refill: None,
        }
    }

    fn refill(&mut self, now: u32, limit: &SendLimit) {
        let capacity = limit.capacity();
        let Some(last_refill) = self.last_refill else {
            // a new bucket starts full
            self.available = capacity;
            self.last_refill = Some(now);
            return;
        };
        let elapsed_ms = wrapping_diff(last_refill, now).max(0);
        self.available += f64::from(limit.bytes_per_sec) * f64::from(elapsed_ms) / 1000.0;
        if self.available > capacity {
            self.available = capacity;
        }
        self.last_refill = Some(now);
    }

    /// Charge `bytes` against the budget. Returns false, charging nothing,
    /// when the budget is used up.
    pub fn try_spend(&mut self, now: u32, bytes: usize, limit: &SendLimit) -> bool {
        if limit.is_unlimited() {
            return true;
        }
        self.refill(now, limit);
        if self.available <= 0.0 {
            return false;
        }
        self.available -= bytes as f64;
        true
    }

    pub fn available(&self) -> f64 {
        self.available
    }
}

impl Default for SendAllowance {
    fn default() -> Self {
        Self::new()
    }
}
