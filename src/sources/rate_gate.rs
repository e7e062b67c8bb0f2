//! Minimum spacing between calls sharing one quota

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::FetchError;

/// Enforces a fixed minimum interval between permits.
///
/// The lock is held across the wait, so concurrent callers are served one at
/// a time in arrival order.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a call is allowed, then record it
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let mut last_call = self.last_call.lock().await;

        if let Some(last) = *last_call {
            let ready_at = last + self.interval;
            if ready_at > Instant::now() {
                tracing::debug!("Rate gate waiting {:?}", ready_at - Instant::now());
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep_until(ready_at) => {}
                }
            }
        }

        *last_call = Some(Instant::now());
        Ok(())
    }
}
