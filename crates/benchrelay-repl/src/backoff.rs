//! Retry backoff for follower deliveries.

use std::time::Duration;

use rand::Rng;

/// Bounds on the delay between delivery attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Smallest delay, used for the first retry and after a success.
    pub base: Duration,
    /// Largest delay a retry will wait.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Stateful backoff with decorrelated jitter.
///
/// Each delay is drawn uniformly from `[base, prev * 3]`, capped at `max`,
/// so retries against a struggling follower spread out instead of arriving
/// in lockstep.
#[derive(Debug)]
pub struct RetryBackoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl RetryBackoff {
    /// Start at the policy's base delay.
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.base;
        Self { policy, current }
    }

    /// Draw the next delay and remember it for the draw after.
    pub fn next_delay(&mut self) -> Duration {
        let upper = (self.current * 3).min(self.policy.max);
        let base_ms = self.policy.base.as_millis() as u64;
        let upper_ms = (upper.as_millis() as u64).max(base_ms);
        let ms = rand::thread_rng().gen_range(base_ms..=upper_ms);
        self.current = Duration::from_millis(ms);
        self.current
    }

    /// Drop back to the base delay after a success.
    pub fn reset(&mut self) {
        self.current = self.policy.base;
    }
}
