//! Retry Policy
//!
//! One reusable bounded retry/backoff policy, applied uniformly to
//! persistence writes and provider calls instead of ad hoc retry
//! loops at each call site. Only errors classified retryable are
//! retried; everything else surfaces immediately.

use std::time::Duration;

use crate::error::Result;

/// Backoff shape between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
}

/// Bounded retry policy
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff,
        }
    }

    /// Policy for durable-store writes
    pub fn persistence() -> Self {
        Self::new(3, Duration::from_millis(150), Backoff::Linear)
    }

    /// Policy for provider transport hiccups (fallback handles the rest)
    pub fn provider() -> Self {
        Self::new(3, Duration::from_millis(500), Backoff::Linear)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_before(&self, retry_number: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay * retry_number,
        }
    }

    /// Run `op`, retrying retryable failures up to the attempt bound.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    tracing::debug!(attempt, error = %err, "retrying after transient failure");
                    tokio::time::sleep(self.delay_before(attempt)).await;
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
    use crate::error::GatewayError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_presets_are_bounded() {
        assert_eq!(RetryPolicy::persistence().max_attempts(), 3);
        assert_eq!(RetryPolicy::provider().max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Backoff::Fixed);
        let attempts = Arc::new(AtomicU32::new(0));

        let result = policy
            .run(|| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::PersistenceTransient("down".into()))
                    } else {
                        Ok("stored")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_bound_is_honored() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Backoff::Linear);
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .run(|| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::PersistenceTransient("still down".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let policy = RetryPolicy::persistence();
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .run(|| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Unauthorized("bad token".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
