use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Minimum spacing between outbound operations, shared by everything that
/// holds the same instance.
///
/// Each gap is `base_delay + uniform(0, jitter)`. The wait happens while the
/// lock is held, so concurrent callers queue up behind each other instead of
/// bursting once the gap has passed.
#[derive(Debug)]
pub struct RateLimiter {
    base_delay: Duration,
    jitter: Duration,
    last_op: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(base_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay,
            jitter,
            last_op: Mutex::new(None),
        }
    }

    /// No spacing at all
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Wait until the gap since the previous operation has elapsed, then
    /// record this operation.
    pub async fn pace(&self) {
        let mut last_op = self.last_op.lock().await;

        if let Some(previous) = *last_op {
            let due = previous + self.next_gap();
            if due > Instant::now() {
                debug!("pacing for {:?}", due.saturating_duration_since(Instant::now()));
                sleep_until(due).await;
            }
        }

        *last_op = Some(Instant::now());
    }

    fn next_gap(&self) -> Duration {
        self.base_delay + random_up_to(self.jitter)
    }
}

/// Uniformly random duration in `[0, max]`, millisecond resolution
pub(crate) fn random_up_to(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=max_ms))
}
