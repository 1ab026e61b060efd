//! Minimum-interval throttle for calls to an AI provider.
//!
//! Each call waits until at least `interval` has passed since the previous
//! one started. State is owned by the adapter instance; the pipeline core
//! never sees it.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct MinIntervalThrottle {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl MinIntervalThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next slot and claim it.
    ///
    /// The lock is held while sleeping so concurrent callers queue up and
    /// are spaced `interval` apart.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        let now = Instant::now();
        let wait = delay_needed(*last, now, self.interval);
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Throttling provider call");
            tokio::time::sleep(wait).await;
        }
        *last = Some(Instant::now());
    }
}

/// How long a call at `now` must wait given the previous call time.
pub fn delay_needed(last: Option<Instant>, now: Instant, interval: Duration) -> Duration {
    match last {
        Some(last) => interval.saturating_sub(now.saturating_duration_since(last)),
        None => Duration::ZERO,
    }
}
