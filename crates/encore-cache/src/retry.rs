//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use encore_core::Result;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Run `operation` up to `attempts` times.
///
/// Only transient errors ([`Error::is_transient`](encore_core::Error::is_transient))
/// are retried; `Ok` results, including `Ok(None)` misses, return immediately.
/// The sleep before attempt `n + 1` is `base * 2^(n - 1)`, capped at five
/// seconds.
pub async fn with_backoff<F, Fut, T>(
    operation_name: &str,
    attempts: u32,
    base: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                let backoff = base
                    .saturating_mul(1u32 << (attempt - 1).min(16))
                    .min(MAX_BACKOFF);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
