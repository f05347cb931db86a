//! Token bucket rate limiting for a single batch run.
//!
//! The bucket starts full, so an idle limiter allows a burst of `capacity`
//! calls; afterwards tokens refill continuously at `capacity / per`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};

use crate::error::{BatchError, Result};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum calls per `per` window, and the bucket size.
    pub capacity: u32,
    /// Length of the window.
    pub per: Duration,
}

impl RateLimitConfig {
    pub fn per_second(capacity: u32) -> Self {
        Self {
            capacity,
            per: Duration::from_secs(1),
        }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            per: Duration::from_secs(60),
        }
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        f64::from(self.capacity.max(1)) / self.per.as_secs_f64().max(f64::EPSILON)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: Option<RateLimitConfig>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            capacity: config.capacity.max(1),
            per: config.per,
        };
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
            config: Some(config),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self {
            config: None,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: Option<RateLimitConfig>) -> Self {
        match config {
            Some(config) => Self::new(config),
            None => Self::unlimited(),
        }
    }

    pub fn config(&self) -> Option<RateLimitConfig> {
        self.config
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let Some(config) = self.config else {
            return true;
        };
        let mut bucket = self.bucket.lock().await;
        refill(&mut bucket, &config);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token.
    ///
    /// With a deadline, gives up once it passes and returns
    /// [`BatchError::RateLimitTimeout`].
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        let Some(config) = self.config else {
            return Ok(());
        };
        let started = Instant::now();

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                refill(&mut bucket, &config);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / config.rate())
                    .max(Duration::from_micros(100))
            };

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BatchError::RateLimitTimeout {
                            waited: now.duration_since(started),
                        });
                    }
                    sleep_until((now + wait).min(deadline)).await;
                }
                None => sleep(wait).await,
            }
        }
    }

    /// Tokens currently in the bucket, or `None` when unlimited.
    pub async fn available(&self) -> Option<f64> {
        let config = self.config?;
        let mut bucket = self.bucket.lock().await;
        refill(&mut bucket, &config);
        Some(bucket.tokens)
    }
}

fn refill(bucket: &mut Bucket, config: &RateLimitConfig) {
    let now = Instant::now();
    let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * config.rate()).min(f64::from(config.capacity));
    bucket.last_refill = now;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_allows_full_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(5));
        for _ in 0..5 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(2));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire(None).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_rate_limit_timeout() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(1));
        limiter.acquire(None).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        let err = limiter.acquire(Some(deadline)).await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            BatchError::RateLimitTimeout { waited } => {
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire(Some(start)).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_bounded_by_rate_plus_burst() {
        let rate = 10;
        let window = Duration::from_secs(3);
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_second(rate)));
        let granted = Arc::new(AtomicUsize::new(0));
        let end = Instant::now() + window;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            let granted = Arc::clone(&granted);
            handles.push(tokio::spawn(async move {
                while limiter.acquire(Some(end)).await.is_ok() {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total = granted.load(Ordering::SeqCst);
        let bound = rate as usize * window.as_secs() as usize + rate as usize;
        assert!(total <= bound, "{total} > {bound}");
        assert!(total >= bound - 2, "throughput too low: {total}");
    }
}
