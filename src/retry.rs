//! Fixed-delay retry of transport operations

use std::future::Future;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{GatewayError, Result};

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// The first attempt is not counted as a retry, so a policy of 3 retries
/// makes at most 4 attempts. Errors that are not transient return
/// immediately without waiting. Running out of attempts yields
/// [`GatewayError::RetriesExhausted`] wrapping the last failure.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.retries + 1;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= attempts => {
                return Err(GatewayError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, attempt, attempts, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(fast(3), "connect", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::connection("refused"))
            } else {
                Ok("up")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(fast(3), "connect", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::connection("refused"))
        })
        .await;

        match result {
            Err(GatewayError::RetriesExhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, GatewayError::Connection(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(fast(3), "exec", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::CommandTimedOut(10))
        })
        .await;

        assert!(matches!(result, Err(GatewayError::CommandTimedOut(10))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_fixed_delay_between_attempts() {
        let policy = RetryPolicy {
            retries: 3,
            delay: Duration::from_secs(5),
        };
        let start = tokio::time::Instant::now();
        let _: Result<()> =
            with_retry(policy, "connect", || async { Err(GatewayError::connection("down")) }).await;

        assert!(start.elapsed() >= Duration::from_secs(15));
        assert!(start.elapsed() < Duration::from_secs(20));
    }
}
