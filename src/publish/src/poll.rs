//! Bounded polling of long running cloud operations.

use std::future::Future;
use std::time::Duration;

use cvm_image_core::error::{PublishError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval and upper bound of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Call `check` until it yields a value, the timeout passes or `cancel` fires.
///
/// `check` returning an error ends the wait with that error.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    config: PollConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + config.timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled(format!("waiting for {what}")));
        }
        if let Some(value) = check().await? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PublishError::Timeout(format!(
                "{what} not ready after {}s",
                config.timeout.as_secs()
            )));
        }
        let sleep_for = config.interval.min(deadline - now);
        tracing::debug!(what = %what, retry_in = ?sleep_for, "Not ready yet");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(PublishError::Cancelled(format!("waiting for {what}")));
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}
