//! Bounded exponential backoff for durable-store writes

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OverseerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Run `op`, retrying transient failures with backoff.
///
/// Non-transient errors are returned immediately. Exhausting the policy on a
/// transient error yields [`OverseerError::Contention`].
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, resource: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    resource,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying contended write"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if err.is_transient() => {
                warn!(resource, attempts = attempt, error = %err, "Giving up on contended write");
                return Err(OverseerError::Contention {
                    resource: resource.to_string(),
                    attempts: attempt,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> OverseerError {
        OverseerError::io("index.json", io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = with_backoff(fast(), "index", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(busy())
            } else {
                Ok(7)
            }
        })
        .await;

        let value = tokio_test::assert_ok!(value);
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_backoff(fast(), "index", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await;

        assert!(matches!(
            result,
            Err(OverseerError::Contention { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_backoff(fast(), "index", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OverseerError::Validation("bad record".into()))
        })
        .await;

        assert!(matches!(result, Err(OverseerError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
