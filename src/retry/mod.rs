//! # Retry
//!
//! The bounded-attempt, exponential-backoff layer used by `ResilientAiClient`
//! (C4). Retries are capped and the caller supplies a `should_retry`
//! predicate, since not every failure is retryable — `AiClientError::RateLimited`
//! must always propagate rather than be retried.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Bounded exponential backoff: `backoff_ms`, `backoff_ms * factor`,
/// `backoff_ms * factor^2`, ... capped at `max_attempts` tries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` up to `max_attempts` times, consulting
    /// `should_retry(&error)` after each failure. The first error for which
    /// `should_retry` returns `false`, or the final exhausted attempt,
    /// propagates as `Err`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        mut should_retry: impl FnMut(&E) -> bool,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        let mut current_backoff = self.policy.backoff_ms;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(label = %label, attempt, "retry succeeded");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if attempt >= self.policy.max_attempts || !should_retry(&e) {
                        warn!(
                            label = %label,
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            error = %e,
                            "giving up"
                        );
                        return Err(e);
                    }

                    warn!(
                        label = %label,
                        attempt,
                        backoff_ms = current_backoff,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    sleep(Duration::from_millis(current_backoff)).await;
                    current_backoff = (current_backoff as f64 * self.policy.backoff_factor) as u64;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let result: Result<i32, &str> = executor
            .execute("t", |_| true, || async { Ok::<i32, &str>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 5,
            backoff_factor: 2.0,
        };
        let executor = RetryExecutor::new(policy);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, &str> = executor
            .execute(
                "t",
                |_| true,
                || {
                    let attempts = attempts_clone.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("temporary")
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 5,
            backoff_factor: 2.0,
        };
        let executor = RetryExecutor::new(policy);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, &str> = executor
            .execute(
                "t",
                |_| false,
                || {
                    let attempts = attempts_clone.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<i32, &str>("rate limited")
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_all_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 5,
            backoff_factor: 2.0,
        };
        let executor = RetryExecutor::new(policy);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, &str> = executor
            .execute(
                "t",
                |_| true,
                || {
                    let attempts = attempts_clone.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<i32, &str>("persistent")
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
