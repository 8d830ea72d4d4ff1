/// Bounded retry with a fixed delay between attempts
use crate::bootstrap::config::RetryConfig;
use crate::error::ReconcileError;
use std::future::Future;

/// Run `op` until it succeeds, fails with a non-retryable error, or `max_attempts` is used up.
///
/// The returned error is the last one observed.
pub async fn retry_with_delay<T, F, Fut>(
    policy: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReconcileError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                tracing::warn!("[Retry] {} failed, not retrying: {}", label, e);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!(
                    "[Retry] {} failed after {} attempts: {}",
                    label,
                    max_attempts,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    "[Retry] Retry {}/{} for {}: {}",
                    attempt + 1,
                    max_attempts,
                    label,
                    e
                );
                attempt += 1;
                tokio::time::sleep(policy.delay()).await;
            }
        }
    }
}
