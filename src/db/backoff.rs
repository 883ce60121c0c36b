//! Backoff between retries of a conflicting transaction.

use crate::error::{StoreError, StoreResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay used for the first real wait.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Wait policy for a single retry loop.
///
/// The first retry happens immediately, the next waits 50ms, and every wait after
/// that is 1.5 times longer than the previous one. There is no ceiling; the caller
/// bounds the loop through cancellation.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    last: Duration,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait before the next attempt and return how long was waited.
    ///
    /// Returns `StoreError::Cancelled` as soon as `scope` is cancelled.
    pub async fn wait(&mut self, scope: &CancellationToken) -> StoreResult<Duration> {
        if self.last.is_zero() {
            self.last = INITIAL_BACKOFF;
            return Ok(Duration::ZERO);
        }

        let delay = self.last;
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                Err(StoreError::cancelled("backoff", "Timed out waiting for backoff"))
            }
            _ = tokio::time::sleep(delay) => {
                self.last = delay * 3 / 2;
                Ok(delay)
            }
        }
    }
}
