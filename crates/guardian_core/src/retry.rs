//! crates/guardian_core/src/retry.rs
//!
//! Exponential backoff with jitter for transient notification failures.

use rand::Rng;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    /// Fractional jitter applied symmetrically, e.g. `0.2` is +/-20%.
    pub jitter: f64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_ms: 250,
            factor: 2.0,
            jitter: 0.2,
            cap_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay to wait before attempt number `attempt` (the first attempt is 0).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1) as f64;
        let mut delay = (self.base_ms as f64) * self.factor.powf(exp);
        if delay > self.cap_ms as f64 {
            delay = self.cap_ms as f64;
        }
        if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(-(self.jitter)..self.jitter);
            delay *= 1.0 + jitter;
            if delay < 0.0 {
                delay = self.base_ms as f64;
            }
        }
        Duration::from_millis(delay.round() as u64)
    }
}
