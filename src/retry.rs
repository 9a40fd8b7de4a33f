//! Backoff policies and bounded retry of transient storage failures.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::warn;

use crate::storage::StorageError;

/// Exponential backoff with optional proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fraction in `[0, 1)`; the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());
        let scaled = if self.jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Bounded retry of storage operations that fail transiently.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRetry {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(2)),
        }
    }
}

impl StorageRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Runs `op` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(60), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.2);
        for _ in 0..100 {
            let d = policy.delay(2).as_secs_f64();
            assert!((0.16..=0.24).contains(&d), "delay {} out of band", d);
        }
    }

    #[tokio::test]
    async fn test_storage_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let retry = StorageRetry {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1)),
        };
        let value = retry
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::ConnectionFailed("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_storage_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let retry = StorageRetry {
            max_attempts: 2,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1)),
        };
        let result: Result<(), _> = retry
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::ConnectionFailed("reset".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_storage_retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = StorageRetry::default()
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Conflict("dup".into()))
            })
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
