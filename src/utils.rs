use crate::calendar::CalendarError;

use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Bounded timeout and retry policy for calendar calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
    /// Attempts after the first one.
    pub retries: usize,
}

/// Runs `f` under `policy`: every attempt is bounded by the timeout, and a failed attempt is
/// retried after a jittered exponential backoff, capped at the timeout, until the retries are
/// spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(op: &str, policy: RetryPolicy, mut f: F) -> Result<T, CalendarError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CalendarError>>,
{
    let base = u64::try_from(policy.backoff.as_millis()).unwrap_or(u64::MAX);
    let strategy = ExponentialBackoff::from_millis(base)
        .max_delay(policy.timeout)
        .map(jitter)
        .take(policy.retries);
    Retry::spawn(strategy, || {
        let attempt = f();
        async move {
            let result = match tokio::time::timeout(policy.timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(CalendarError::Timeout),
            };
            if let Err(e) = &result {
                warn!(error=%e, op, "calendar attempt failed");
            }
            result
        }
    })
    .await
}
