//! Bounded retry of transient storage errors.
//!
//! This is separate from task-level retries: it only re-runs a single store operation
//! that hit lock contention, and gives up after `max_attempts`, handing the last error
//! to the caller.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::RetryPolicy;
use crate::ports::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct TransientRetry {
    max_attempts: u32,
    backoff: RetryPolicy,
}

impl TransientRetry {
    pub fn new(max_attempts: u32, backoff: RetryPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.next_delay(attempt - 1);
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self::new(
            5,
            RetryPolicy::new(Duration::from_millis(50))
                .with_max_delay(Duration::from_secs(2))
                .with_jitter(0.5),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> TransientRetry {
        TransientRetry::new(max_attempts, RetryPolicy::new(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = fast(5)
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Busy("database is locked".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_error_once_budget_is_spent() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast(3)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Busy("database is locked".into()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Busy(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Backend("no such table: tasks".into()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
