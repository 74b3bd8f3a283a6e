//! Bounded local retry for transient infrastructure failures.
//!
//! Queue submissions and HTTP downloads are attempted up to
//! [`TRANSIENT_ATTEMPTS`] times with a short doubling delay. Errors that are
//! not transient are returned on the first failure.

use std::future::Future;
use std::time::Duration;

/// Total attempts for a transient operation (first try included).
pub const TRANSIENT_ATTEMPTS: u32 = 3;

const INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Classifies errors as worth another attempt or not.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Run `operation` up to `attempts` times while it fails with a retryable
/// error. Returns the first success or the last error.
pub async fn with_retries<F, Fut, T, E>(attempts: u32, what: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    let mut delay = INITIAL_DELAY;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = what, attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    operation = what,
                    error = %e,
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    operation = what,
                    error = %e,
                    attempts = attempt,
                    "Operation failed"
                );
                return Err(e);
            }
        }
    }
}
