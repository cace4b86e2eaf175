//! Bounded connect retry with a fixed delay between attempts.
//!
//! Exceeding the attempt budget is fatal and surfaces as
//! [`PoolError::ConnectionExhausted`].

use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio::time::sleep;

use crate::error::PoolError;

/// Attempt budget and the fixed pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

/// Run `operation` until it succeeds or the budget is spent.
pub async fn connect_with_retry<F, Fut, T, E>(
    target: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, PoolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                warn!(
                    "connection attempt {}/{} to {} failed: {}",
                    attempt, attempts, target, e
                );
                if attempt < attempts {
                    sleep(policy.delay).await;
                }
            }
        }
    }
    Err(PoolError::ConnectionExhausted {
        target: target.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let result: Result<u32, PoolError> =
            connect_with_retry("db", fast_policy(3), || async { Ok::<_, PoolError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = connect_with_retry("db", fast_policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_fatal() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), PoolError> = connect_with_retry("db", fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("refused") }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(PoolError::ConnectionExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ConnectionExhausted, got {other:?}"),
        }
    }
}
