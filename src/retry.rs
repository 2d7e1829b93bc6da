//! Retry logic with exponential backoff
//!
//! Used only for the narrow calls that are safe to repeat within one cycle:
//! resource tagging and fulfillment polling. Decision and swap steps never
//! retry in-process; they rely on the next cycle's tag-based rediscovery.

use crate::error::{IsRetryable, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Retry policy trait
pub trait RetryPolicy: Send + Sync {
    /// Execute a function with retry logic
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send;
}

/// Exponential backoff retry policy
pub struct ExponentialBackoffPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }

    /// Policy for cloud API calls (5 attempts)
    pub fn for_cloud_api() -> Self {
        Self::new(5)
    }

    /// Calculate backoff delay for given attempt number
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponential = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let delay_ms = exponential.min(self.max_delay.as_millis() as f64);

        // Add jitter to prevent thundering herd
        let jitter = delay_ms * self.jitter_factor * fastrand::f64();
        Duration::from_millis((delay_ms + jitter) as u64)
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(attempt, "operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        warn!(error = %e, "non-retryable error, aborting");
                        return Err(e);
                    }
                    if attempt + 1 >= self.max_attempts {
                        warn!(max_attempts = self.max_attempts, error = %e, "max retries reached");
                        return Err(e);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retryable error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpotctlError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = ExponentialBackoffPolicy::new(5);
        let result = policy
            .execute_with_retry(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SpotctlError::cloud_msg("CreateTags", "throttled"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_abort_immediately() {
        let calls = AtomicU32::new(0);
        let policy = ExponentialBackoffPolicy::new(5);
        let result: Result<()> = policy
            .execute_with_retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SpotctlError::NoDonor {
                    group: "web-asg".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let calls = AtomicU32::new(0);
        let policy = ExponentialBackoffPolicy::new(2);
        let result: Result<()> = policy
            .execute_with_retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SpotctlError::cloud_msg("CreateTags", "throttled"))
            })
            .await;
        assert!(matches!(result, Err(SpotctlError::CloudApi { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
