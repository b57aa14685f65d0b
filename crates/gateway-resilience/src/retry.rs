//! Bounded retry with exponential backoff and jitter.
//!
//! The delay schedule is a pure function of the attempt number and a jitter
//! sample, which keeps it testable. Sleeping uses `tokio::time::sleep`, so a
//! retry loop is abandoned as soon as the surrounding future is dropped.

use gateway_core::{GatewayError, GatewayResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Relative jitter applied to each delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    ///
    /// `jitter_sample` is expected in `[-1, 1]` and scales the delay by
    /// `1 + jitter * jitter_sample`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let factor = 1.0 + self.jitter.clamp(0.0, 1.0) * jitter_sample.clamp(-1.0, 1.0);
        let secs = (capped * factor).max(0.0);

        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Delay before retry number `attempt` with a random jitter sample
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.backoff_delay(attempt, sample)
    }

    /// Whether `error` should be retried after `attempt` retries
    #[must_use]
    pub fn should_retry(&self, error: &GatewayError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_transient()
    }

    /// Run `operation`, retrying transient failures
    ///
    /// `operation` receives the 0-based attempt number.
    ///
    /// # Errors
    /// Returns the last error once it is non-transient or retries are exhausted
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Retrying after transient failure"
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
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn assert_millis(delay: Duration, expected: f64) {
        let actual = delay.as_secs_f64() * 1_000.0;
        assert!((actual - expected).abs() < 0.01, "{actual}ms != {expected}ms");
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();

        assert_millis(policy.backoff_delay(0, 0.0), 100.0);
        assert_millis(policy.backoff_delay(1, 0.0), 200.0);
        assert_millis(policy.backoff_delay(2, 0.0), 400.0);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy::default();

        assert_millis(policy.backoff_delay(0, 1.0), 125.0);
        assert_millis(policy.backoff_delay(0, -1.0), 75.0);

        for _ in 0..100 {
            let delay = policy.delay_for(1);
            let millis = delay.as_secs_f64() * 1_000.0;
            assert!((149.99..=250.01).contains(&millis), "{millis}ms");
        }
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        assert_millis(policy.backoff_delay(10, 0.0), 300.0);
        assert_millis(policy.backoff_delay(u32::MAX, 0.0), 300.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::backend("m", "unavailable", Some(503), true))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: GatewayResult<()> = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::timeout(Duration::from_secs(1)))
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: GatewayResult<()> = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::backend("m", "bad request", Some(400), false))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_open_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: GatewayResult<()> = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::dependency_unavailable("m", "circuit breaker is open"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
