//! Exponential reconnect backoff

use std::time::Duration;

/// Longest shift applied to the base delay
const MAX_EXPONENT: u32 = 16;

/// Doubles the delay after every consecutive failure, up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    /// Zero means unlimited
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts = self.attempts.saturating_add(1);

        let exponent = (self.attempts - 1).min(MAX_EXPONENT);
        let delay = self.base.saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_delay))
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
