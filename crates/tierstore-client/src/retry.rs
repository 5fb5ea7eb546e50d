//! Bounded exponential backoff for remote requests

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tierstore_common::config::RetryConfig;
use tierstore_common::{Error, Result};
use tracing::warn;

/// Attempt budget and backoff bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Upper bound of the delay after the `retry`th failure (1-based)
    #[must_use]
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`
    fn backoff(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry);
        if ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(ms)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                if attempt >= policy.max_attempts {
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    operation, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(300));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_millis(300));
        for retry in 1..6 {
            let delay = policy.backoff(retry);
            assert!(delay <= policy.backoff_ceiling(retry));
            assert!(delay >= policy.backoff_ceiling(retry) / 2);
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(5), "GET", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::ConnectionFailed("reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(3), "PUT", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout)
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(5), "GET", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::internal("bad request"))
        })
        .await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
