//! Inter-request delay with error backoff.

use std::time::Duration;

use rand::Rng;

/// Computes how long to sleep before the next request.
///
/// Quiet operation sleeps the baseline `--wait`. Consecutive errors grow
/// the delay geometrically up to `--waitretry`; any success resets it.
#[derive(Debug, Clone)]
pub struct Waiter {
    wait: Duration,
    wait_retry: Duration,
    random: bool,
    current: Duration,
}

impl Waiter {
    pub fn new(wait: Duration, wait_retry: Duration, random: bool) -> Self {
        Self {
            wait,
            wait_retry,
            random,
            current: wait,
        }
    }

    /// The delay to apply now. `--random-wait` perturbs it by a uniform
    /// factor in [0.5, 1.5] so fetch intervals do not fingerprint us.
    pub fn get(&self) -> Duration {
        if self.current.is_zero() {
            return Duration::ZERO;
        }
        if !self.random {
            return self.current;
        }
        let factor = rand::rng().random_range(0.5..1.5);
        self.current.mul_f64(factor)
    }

    /// Record a failed attempt: double the delay, capped at the retry
    /// ceiling. The first error starts from at least one second.
    pub fn increment(&mut self) {
        let next = if self.current.is_zero() {
            Duration::from_secs(1).max(self.wait)
        } else {
            self.current * 2
        };
        self.current = next.min(self.wait_retry);
    }

    /// Record a success: back to the baseline.
    pub fn reset(&mut self) {
        self.current = self.wait;
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new(Duration::ZERO, Duration::from_secs(10), false)
    }
}
