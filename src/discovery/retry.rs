//! Bounded backoff for throttled API calls

use std::future::Future;
use tracing::warn;

use crate::aws::ApiResult;
use crate::config::RetryPolicy;

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Only throttling is retried.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Throttled, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
