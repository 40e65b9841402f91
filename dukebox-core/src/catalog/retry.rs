//! Bounded retry for backend refreshes talking to flaky upstreams.
//!
//! Only the rate-limit class of transport failures (HTTP 4xx) is
//! retried, with a linear backoff; every other error propagates
//! immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

pub(crate) const DEFAULT_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Runs `op` up to `attempts` times, sleeping `backoff * attempt`
/// between retryable failures.
pub async fn with_backoff<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff * attempt;
                warn!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
