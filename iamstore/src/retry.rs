//! Shared retry policy with fixed or exponential backoff.
//!
//! One policy type serves every caller that expects transient failures: the
//! singleton workflow retrying lock contention, command handlers retrying
//! concurrency conflicts, and startup code waiting for the store. Retries honor
//! a [`CancellationToken`] both while an attempt runs and while backing off.

use iamstore_types::StoreError;
use rand::Rng;
use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Classifies errors as worth another attempt.
pub trait Retryable {
    /// Returns true if repeating the operation may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed {
        /// Delay between attempts.
        delay: Duration,
    },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        initial: Duration,
        /// Upper bound for any delay.
        max: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay schedule.
    pub backoff: Backoff,
    /// Random spread applied to each delay, as a fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(5),
                multiplier: 2.0,
            },
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fixed attempt count with a fixed delay and no jitter.
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            jitter: 0.0,
        }
    }

    /// Exponential backoff doubling from `initial` up to `max`.
    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max,
                multiplier: 2.0,
            },
            jitter: 0.0,
        }
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts actually made, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the `attempt`-th failure (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let seconds = initial.as_secs_f64() * multiplier.powi(exponent);
                if !seconds.is_finite() || seconds >= max.as_secs_f64() {
                    return max;
                }
                Duration::try_from_secs_f64(seconds).unwrap_or(max)
            }
        }
    }

    /// Delay after the `attempt`-th failure with jitter applied.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: E,
    },
    /// An attempt failed with an error that retrying cannot fix.
    #[error("{0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// Returns the underlying error, if any attempt produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last_error, .. } | Self::Permanent(last_error) => Some(last_error),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, runs out of attempts, or
/// `cancel` fires.
///
/// `operation` names the call in log records.
///
/// # Example
///
/// ```ignore
/// let policy = RetryPolicy::fixed(5, Duration::from_millis(200));
/// let committed = retry(&policy, &cancel, "append_user", || log.append(request.clone())).await?;
/// ```
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if cancel.is_cancelled() {
        return Err(RetryError::Cancelled);
    }

    let max_attempts = policy.attempts();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => result,
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "[retry.recovered] operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(RetryError::Permanent(error));
        }

        if attempt >= max_attempts {
            warn!(
                operation,
                attempts = attempt,
                error = %error,
                "[retry.exhausted] giving up"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.jittered_delay_for(attempt);
        debug!(
            operation,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "[retry.backoff] retrying after transient failure"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient)
        }
    }

    #[test]
    fn fixed_backoff_uses_constant_delay() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).attempts(), 1);
    }

    #[test]
    fn policy_deserializes_tagged_backoff() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{ "max_attempts": 5, "backoff": { "kind": "fixed", "delay": { "secs": 1, "nanos": 0 } } }"#,
        )
        .expect("valid policy");

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn jitter_stays_within_fraction(attempt in 1u32..8, jitter in 0.0f64..=1.0) {
            let policy = RetryPolicy::exponential(8, Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter(jitter);
            let base = policy.delay_for(attempt).as_secs_f64();
            let delay = policy.jittered_delay_for(attempt).as_secs_f64();

            prop_assert!(delay >= base * (1.0 - jitter) - 1e-9);
            prop_assert!(delay <= base * (1.0 + jitter) + 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));

        let result = retry(&policy, &CancellationToken::new(), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(logs_contain("[retry.recovered]"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_millis(50));

        let result: Result<(), _> = retry(&policy, &CancellationToken::new(), "test", || {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(RetryError::Permanent(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retry_reports_exhaustion_with_last_error() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(50));

        let result: Result<(), _> = retry(&policy, &CancellationToken::new(), "test", || async {
            Err(TestError::Transient)
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last_error: TestError::Transient
            })
        );
        assert!(logs_contain("[retry.exhausted] giving up"));
    }

    #[tokio::test]
    async fn retry_does_not_start_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> =
            retry(&RetryPolicy::default(), &cancel, "test", || {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::fixed(10, Duration::from_secs(60));
        let canceller = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = retry(&policy, &cancel, "test", || async {
            Err(TestError::Transient)
        })
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
