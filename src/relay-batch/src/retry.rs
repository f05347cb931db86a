//! Retry policy: exponential backoff with jitter.
//!
//! `delay = base * 2^retry * (1 ± jitter)`, capped at `max_delay`, where
//! `retry` is zero for the pause before the second attempt.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per task, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Jitter fraction (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` attempts that ended
    /// with an error of the given retry class.
    pub fn should_retry(&self, attempts: u32, retryable: bool) -> bool {
        retryable && attempts < self.max_attempts
    }

    /// Delay before retry number `retry` (zero-based) with no jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let factor = 2f64.powi(retry.min(32) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Stateful delay generator owning its jitter source.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    rng: StdRng,
}

impl Backoff {
    /// A seed makes the jitter sequence reproducible.
    pub fn new(policy: RetryPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { policy, rng }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&mut self, retry: u32) -> Duration {
        let factor = 2f64.powi(retry.min(32) as i32);
        let mut secs = self.policy.base_delay.as_secs_f64() * factor;

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let u: f64 = self.rng.random_range(-1.0..=1.0);
            secs *= 1.0 + jitter * u;
        }

        Duration::from_secs_f64(secs.clamp(0.0, self.policy.max_delay.as_secs_f64()))
    }
}
