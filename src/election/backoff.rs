//! Retry Backoff
//!
//! Exponential delay between failed acquisition attempts.

use std::time::Duration;

use rand::Rng;

/// Fraction by which a poll interval may be shortened
const POLL_JITTER: f64 = 0.2;

/// Doubling delay, capped, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `base` and never exceeding `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Poll interval shortened by a random fraction, so participants started
/// together drift apart while still polling at least once per `period`
pub(crate) fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range((1.0 - POLL_JITTER)..=1.0);
    period.mul_f64(factor)
}
