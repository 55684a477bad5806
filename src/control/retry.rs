use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use super::rate_limiter::random_up_to;
use crate::error::SourceError;

/// Result of running an operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    /// Set when every attempt failed and `value` is the fallback
    pub last_error: Option<SourceError>,
}

impl<T> Attempted<T> {
    pub fn exhausted(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Bounded retries with exponential backoff.
///
/// Ordinary failures wait `backoff_base * 2^(attempt-1) + jitter`. A
/// [`SourceError::Blocked`] waits once for a random duration between
/// `block_backoff_min` and `block_backoff_max` instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
    pub jitter: Duration,
    pub block_backoff_min: Duration,
    pub block_backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(2),
            jitter: Duration::from_millis(500),
            block_backoff_min: Duration::from_secs(10),
            block_backoff_max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, for tests and dry runs
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            backoff_base: Duration::ZERO,
            jitter: Duration::ZERO,
            block_backoff_min: Duration::ZERO,
            block_backoff_max: Duration::ZERO,
        }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor) + random_up_to(self.jitter)
    }

    pub fn block_backoff(&self) -> Duration {
        let spread = self.block_backoff_max.saturating_sub(self.block_backoff_min);
        self.block_backoff_min + random_up_to(spread)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Never fails: after the last attempt the default value is returned
    /// together with the last error. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Attempted<T>
    where
        T: Default,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", label, attempt, attempts);
                    }
                    return Attempted {
                        value,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Err(e) => {
                    warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                    if !e.is_retryable() {
                        return Attempted {
                            value: T::default(),
                            attempts: attempt,
                            last_error: Some(e),
                        };
                    }
                    if attempt < attempts {
                        let wait = if e.is_blocked() {
                            self.block_backoff()
                        } else {
                            self.backoff_for(attempt)
                        };
                        info!("{} backing off for {:?}", label, wait);
                        sleep(wait).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        warn!("{} gave up after {} attempts", label, attempts);
        Attempted {
            value: T::default(),
            attempts,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn always_failing_op_is_tried_exactly_attempts_times() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let outcome: Attempted<Vec<String>> = policy
            .run("flaky", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::Parse("no json".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.value.is_empty());
        assert!(matches!(outcome.last_error, Some(SourceError::Parse(_))));
    }

    #[tokio::test]
    async fn recovers_after_soft_miss() {
        let policy = RetryPolicy::immediate(3);

        let outcome = policy
            .run("soft", |attempt| async move {
                if attempt == 1 {
                    Err(SourceError::SoftMiss("no cards".into()))
                } else {
                    Ok(vec![attempt])
                }
            })
            .await;

        assert_eq!(outcome.value, vec![2]);
        assert_eq!(outcome.attempts, 2);
        assert!(!outcome.exhausted());
    }

    #[tokio::test]
    async fn blocked_uses_block_backoff() {
        let policy = RetryPolicy {
            attempts: 2,
            backoff_base: Duration::ZERO,
            jitter: Duration::ZERO,
            block_backoff_min: Duration::from_millis(60),
            block_backoff_max: Duration::from_millis(80),
        };
        let started = tokio::time::Instant::now();

        let outcome: Attempted<Vec<u8>> = policy
            .run("blocked", |_| async { Err(SourceError::Blocked("captcha".into())) })
            .await;

        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(outcome.exhausted());
    }

    #[tokio::test]
    async fn invalid_params_are_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: Attempted<Vec<u8>> = RetryPolicy::immediate(3)
            .run("homegate", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::InvalidParams("zip missing".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.exhausted());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_secs(2),
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
    }

    #[test]
    fn block_backoff_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let wait = policy.block_backoff();
            assert!(wait >= Duration::from_secs(10) && wait <= Duration::from_secs(300));
        }
    }
}
