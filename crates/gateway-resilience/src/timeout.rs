//! Timeouts and request deadlines.
//!
//! Every external call carries its own timeout, and a request-wide
//! [`Deadline`] bounds the whole pipeline including retries.

use gateway_core::GatewayError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Point in time by which a request must finish
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    budget: Duration,
    expires_at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            budget,
            expires_at: Instant::now() + budget,
        }
    }

    /// Run `future` until it finishes or the deadline passes
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` carrying the full budget on expiry, or
    /// the error produced by `future`
    pub async fn run<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout_at(self.expires_at, future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.budget.as_millis(), "Request deadline exceeded");
                Err(GatewayError::timeout(self.budget))
            }
        }
    }
}

/// Run a fallible `future` with a timeout, flattening the result
///
/// # Errors
/// Returns `GatewayError::Timeout` if the operation times out, otherwise the
/// error produced by `future`
pub async fn with_timeout<F, T>(timeout: Duration, future: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_success() {
        let deadline = Deadline::after(Duration::from_secs(1));

        let result: Result<u32, GatewayError> = deadline
            .run(async {
                sleep(Duration::from_millis(10)).await;
                Ok(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let deadline = Deadline::after(Duration::from_millis(50));

        let result: Result<u32, GatewayError> = deadline
            .run(async {
                sleep(Duration::from_secs(10)).await;
                Ok(42)
            })
            .await;

        match result {
            Err(GatewayError::Timeout { duration }) => {
                assert_eq!(duration, Duration::from_millis(50));
            }
            _ => panic!("Expected timeout error"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_shared_across_calls() {
        let deadline = Deadline::after(Duration::from_secs(10));

        let first: Result<(), GatewayError> = deadline
            .run(async {
                sleep(Duration::from_secs(8)).await;
                Ok(())
            })
            .await;
        assert!(first.is_ok());

        // Only two seconds of the budget are left
        let second: Result<(), GatewayError> = deadline
            .run(async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(GatewayError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let result = with_timeout(Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let result: Result<(), GatewayError> = with_timeout(Duration::from_millis(50), async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
    }
}
