//! Bounded timeout + retry for upstream calls.

use std::future::Future;
use std::time::Duration;

use dashlite_core::FetchError;
use metrics::counter;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Total attempts including the first; at least one is always made.
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles from
    /// `backoff_initial`, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.backoff_initial, self.backoff_max, attempt)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt cap is reached. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let res = match tokio::time::timeout(self.timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(FetchError::Timeout(self.timeout.as_millis() as u64)),
            };
            match res {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(what, attempt, "fetch: recovered after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    counter!("fetch_errors_total", 1u64, "code" => e.code());
                    if !e.is_retryable() || attempt >= attempts {
                        warn!(what, attempt, error = %e, "fetch: giving up");
                        return Err(e);
                    }
                    let delay = self.backoff(attempt);
                    warn!(what, attempt, delay_ms = %delay.as_millis(), error = %e, "fetch: retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub(crate) fn exponential_backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(1),
            max_attempts: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(150),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(150));
        assert_eq!(p.backoff(30), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<(), _> = policy()
            .run("pods", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Transient("503".into()))
                }
            })
            .await;
        assert_eq!(res, Err(FetchError::Transient("503".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<(), _> = policy()
            .run("pods", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Forbidden("rbac".into()))
                }
            })
            .await;
        assert!(matches!(res, Err(FetchError::Forbidden(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out_then_recover() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res = policy()
            .run("pods", || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, FetchError>(7)
                }
            })
            .await;
        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
