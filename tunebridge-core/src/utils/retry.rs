//! Retry with exponential backoff
//!
//! Two policies: [`retry_on_lock`] is time-bounded and only retries SQLite
//! lock contention; [`retry_transient`] is count-bounded and retries adapter
//! errors classified as transient.

use std::future::Future;
use std::time::{Duration, Instant};
use tunebridge_common::{Error, Result};

use crate::adapters::AdapterError;

const LOCK_INITIAL_BACKOFF_MS: u64 = 10;
const LOCK_MAX_BACKOFF_MS: u64 = 1000;

/// Retry a store operation while SQLite reports "database is locked"
///
/// Backoff starts at 10ms and doubles up to 1s. Other errors are returned
/// immediately. Once `max_wait_ms` has elapsed the last attempt's failure
/// becomes [`Error::Internal`].
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = LOCK_INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_lock_contention() => return Err(err),
            Err(_) => {
                let elapsed = start_time.elapsed();

                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Store operation failed: max lock wait exceeded"
                    );
                    return Err(Error::Internal(format!(
                        "Database locked after {} attempts ({} ms elapsed, max {} ms)",
                        attempt,
                        elapsed.as_millis(),
                        max_wait_ms
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(LOCK_MAX_BACKOFF_MS);
            }
        }
    }
}

/// Retry an adapter call on transient errors
///
/// Makes at most `max_retries + 1` attempts, sleeping `base_backoff_ms`,
/// then twice that, and so on between them. Non-transient errors end the
/// loop at once.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    max_retries: u32,
    base_backoff_ms: u64,
    mut operation: F,
) -> std::result::Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, AdapterError>>,
{
    let mut attempt = 0u32;
    let mut backoff_ms = base_backoff_ms;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_transient() && attempt < max_retries => {
                attempt += 1;
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    error = %err,
                    "Transient adapter error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}
