//! Retry policy and request timeouts for directory calls.
//!
//! The policy is a plain value object: attempt budget, exponential backoff and
//! a jitter function. Callers invoke it uniformly regardless of which
//! directory is on the other end.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{DirectoryError, DirectoryResult};

/// Jitter applied to a computed backoff delay.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Adds up to 25% random jitter.
#[must_use]
pub fn proportional_jitter() -> JitterFn {
    Arc::new(|delay: Duration| {
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=0.25);
        delay.mul_f64(factor)
    })
}

/// Returns the delay unchanged.
#[must_use]
pub fn no_jitter() -> JitterFn {
    Arc::new(|delay: Duration| delay)
}

/// Retry policy for transient directory failures.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    pub jitter: JitterFn,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: proportional_jitter(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed), before jitter.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay actually slept before retry number `retry`.
    ///
    /// A server-provided retry-after hint acts as a floor.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &DirectoryError) -> Duration {
        let delay = (self.jitter)(self.backoff(retry));
        match error {
            DirectoryError::RateLimited {
                retry_after_ms: Some(ms),
            } => delay.max(Duration::from_millis(*ms)),
            _ => delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently or the attempt
    /// budget is spent.
    ///
    /// Exhaustion yields `RetriesExhausted` wrapping the last transient error.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> DirectoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DirectoryResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(DirectoryError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt - 1, &e);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Bound a directory call by `timeout`; elapsing counts as a transient
/// `Timeout` error.
pub async fn with_timeout<Fut, T>(timeout: Duration, future: Fut) -> DirectoryResult<T>
where
    Fut: Future<Output = DirectoryResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(DirectoryError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1)).with_jitter(no_jitter())
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, DirectoryError>(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DirectoryError::RateLimited {
                            retry_after_ms: None,
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: DirectoryResult<()> = fast_policy(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DirectoryError::invalid_data("bad")) }
            })
            .await;
        assert_eq!(result.unwrap_err().error_code(), "INVALID_DATA");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: DirectoryResult<()> = fast_policy(3)
            .execute(|| async { Err(DirectoryError::Timeout { timeout_ms: 5 }) })
            .await;
        match result.unwrap_err() {
            DirectoryError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.error_code(), "TIMEOUT");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(no_jitter());
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let policy = fast_policy(3);
        let err = DirectoryError::RateLimited {
            retry_after_ms: Some(250),
        };
        assert_eq!(policy.delay_for(0, &err), Duration::from_millis(250));
    }

    #[test]
    fn test_proportional_jitter_bounds() {
        let jitter = proportional_jitter();
        for _ in 0..50 {
            let d = jitter(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(1000));
            assert!(d <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: DirectoryResult<()> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DirectoryError::Timeout { .. })));
    }
}
