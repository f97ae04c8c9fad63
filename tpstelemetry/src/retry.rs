//! Exponential backoff around a single request attempt.
//!
//! [`retry_with_backoff`] runs an attempt, asks the classifier whether a failure
//! may be retried and sleeps for the backoff delay (or the server's throttle hint
//! when it is longer) before the next attempt. Retries stop once the elapsed time
//! plus the next delay would exceed [`RetryConfig::max_elapsed_time`].
//!
//! Cancellation works through the optional deadline: if the deadline fires while
//! a backoff timer is armed the call returns [`RetryError::Cancelled`]. When both
//! fire together the timer wins and the next attempt still runs.

use crate::tps_debug;
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_ELAPSED_TIME: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
pub(crate) const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Give up immediately.
    NonRetryable,
    /// Retry after the backoff delay.
    Retryable,
    /// Retry after at least the given server-supplied delay.
    Throttled(Duration),
}

/// Backoff settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// When false, exactly one attempt is made.
    pub enabled: bool,
    /// Delay before the first retry.
    #[serde(with = "crate::config::duration_ms")]
    pub initial_interval: Duration,
    /// Upper bound of a single delay.
    #[serde(with = "crate::config::duration_ms")]
    pub max_interval: Duration,
    /// Total time budget across all attempts. Zero means a single attempt.
    #[serde(with = "crate::config::duration_ms")]
    pub max_elapsed_time: Duration,
    /// Jitter applied to each delay, as a fraction of the current interval.
    pub randomization_factor: f64,
    /// Growth of the interval between retries.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            enabled: true,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed_time: DEFAULT_MAX_ELAPSED_TIME,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    pub fn disabled() -> Self {
        RetryConfig {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The classifier marked the error as permanent.
    #[error(transparent)]
    Permanent(E),
    /// The time budget ran out; carries the last error.
    #[error("max retry time elapsed: {0}")]
    Elapsed(E),
    /// The deadline fired while waiting for the next attempt.
    #[error("context canceled")]
    Cancelled,
}

/// Exponential backoff state with randomized delays.
#[derive(Debug)]
struct Backoff {
    current: Duration,
    max_interval: Duration,
    randomization_factor: f64,
    multiplier: f64,
}

impl Backoff {
    fn new(config: &RetryConfig) -> Self {
        Backoff {
            current: config.initial_interval,
            max_interval: config.max_interval,
            randomization_factor: config.randomization_factor.clamp(0.0, 1.0),
            multiplier: config.multiplier.max(1.0),
        }
    }

    // Returns current * (1 + U(-r, r)) capped at max_interval, then grows current.
    fn next_delay(&mut self) -> Duration {
        let current = self.current.as_secs_f64();
        let r = self.randomization_factor;
        let jitter = if r > 0.0 {
            rand::rng().random_range(-r..=r)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64((current * (1.0 + jitter)).max(0.0));

        let grown = current * self.multiplier;
        self.current = if grown >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };

        delay.min(self.max_interval)
    }
}

/// Runs `attempt` until it succeeds, fails permanently or exhausts the budget.
///
/// * `config` - backoff settings.
/// * `operation_name` - used in internal logs.
/// * `deadline` - caller deadline; `None` waits as long as the budget allows.
/// * `attempt` - produces one attempt per call.
/// * `classify` - decides whether an error may be retried.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    operation_name: &str,
    deadline: Option<Instant>,
    mut attempt: F,
    classify: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryErrorType,
    E: std::fmt::Display,
{
    if !config.enabled {
        return attempt().await.map_err(RetryError::Permanent);
    }

    let start = Instant::now();
    let mut backoff = Backoff::new(config);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let throttle = match classify(&err) {
            RetryErrorType::NonRetryable => return Err(RetryError::Permanent(err)),
            RetryErrorType::Retryable => Duration::ZERO,
            RetryErrorType::Throttled(hint) => hint,
        };

        let delay = backoff.next_delay().max(throttle);
        if start.elapsed() + delay > config.max_elapsed_time {
            tps_debug!(
                name: "Retry.BudgetElapsed",
                operation = operation_name,
                attempts = attempts,
                error = err.to_string()
            );
            return Err(RetryError::Elapsed(err));
        }

        tps_debug!(
            name: "Retry.Scheduled",
            operation = operation_name,
            attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = err.to_string()
        );

        let timer = tokio::time::sleep(delay);
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = timer => {}
                    _ = tokio::time::sleep_until(deadline) => return Err(RetryError::Cancelled),
                }
            }
            None => timer.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            enabled: true,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            max_elapsed_time: Duration::from_secs(5),
            randomization_factor: 0.5,
            multiplier: 1.5,
        }
    }

    fn always_retry(_: &&str) -> RetryErrorType {
        RetryErrorType::Retryable
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let result = retry_with_backoff(&fast_config(), "test", None, || async { Ok::<_, &str>(7) }, always_retry).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicUsize::new(0);
        let result = retry_with_backoff(
            &fast_config(),
            "test",
            None,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("unavailable")
                    } else {
                        Ok("done")
                    }
                }
            },
            always_retry,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_budget_means_one_attempt() {
        let attempts = AtomicUsize::new(0);
        let config = RetryConfig {
            max_elapsed_time: Duration::ZERO,
            ..fast_config()
        };
        let result = retry_with_backoff(
            &config,
            "test",
            None,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("unavailable") }
            },
            always_retry,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Elapsed("unavailable"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_makes_single_attempt() {
        let attempts = AtomicUsize::new(0);
        let result = retry_with_backoff(
            &RetryConfig::disabled(),
            "test",
            None,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("unavailable") }
            },
            always_retry,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let attempts = AtomicUsize::new(0);
        let result = retry_with_backoff(
            &fast_config(),
            "test",
            None,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("permission denied") }
            },
            |_| RetryErrorType::NonRetryable,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent("permission denied"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_longer_than_budget_aborts() {
        let config = RetryConfig {
            max_elapsed_time: Duration::from_secs(1),
            ..fast_config()
        };
        let result = retry_with_backoff(
            &config,
            "test",
            None,
            || async { Err::<(), _>("slow down") },
            |_| RetryErrorType::Throttled(Duration::from_secs(10)),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Elapsed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_armed_timer() {
        let config = RetryConfig {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(2),
            randomization_factor: 0.0,
            ..fast_config()
        };
        let deadline = Instant::now() + Duration::from_millis(100);
        let result = retry_with_backoff(
            &config,
            "test",
            Some(deadline),
            || async { Err::<(), _>("unavailable") },
            always_retry,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(&RetryConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(300),
            randomization_factor: 0.0,
            multiplier: 2.0,
            ..Default::default()
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        let mut backoff = Backoff::new(&RetryConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            randomization_factor: 0.5,
            multiplier: 1.0,
            ..Default::default()
        });
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }
}
