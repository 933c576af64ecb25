//! Retry executor with exponential backoff and typed outcomes.
//!
//! Instead of "catch error, retry", operations classify their own result as
//! [`Attempt::Ok`], [`Attempt::Retryable`], or [`Attempt::Fatal`]. The
//! executor only decides *whether* and *how long* to wait; what counts as
//! retryable stays with the operation, where the knowledge lives.
//!
//! # Backoff
//!
//! After failed attempt `k` (1-based) the executor sleeps
//! `base_delay * 2^(k-1)`, capped at `max_delay`.
//!
//! # Example
//!
//! ```rust
//! use herald_runtime::retry::{Attempt, RetryPolicy, run_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), herald_runtime::retry::RetryError<String>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let value = run_with_backoff(&policy, |_attempt| async {
//!     Attempt::<_, String>::Ok(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Typed outcome of one attempt of a fallible operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T, E> {
    /// The operation succeeded.
    Ok(T),
    /// The operation failed in a way a later attempt may fix.
    Retryable(E),
    /// The operation failed permanently; retrying is pointless.
    Fatal(E),
}

/// Why a retried operation ultimately failed.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt within the budget failed with a retryable error.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: usize,
        /// The error from the final attempt.
        last: E,
    },

    /// An attempt failed with a non-retryable error.
    #[error("fatal error on attempt {attempt}: {source}")]
    Fatal {
        /// The attempt that hit the fatal error.
        attempt: usize,
        /// The fatal error itself.
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Unwrap the underlying operation error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal { source, .. } => source,
        }
    }
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: usize,
    /// Backoff slept after the first failed attempt.
    pub base_delay: Duration,
    /// Cap on any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            max_delay: None,
        }
    }

    /// Backoff slept after failed attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    #[must_use]
    pub fn backoff_after(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        // 2^31 ms already exceeds any sane cap; avoid overflow past that.
        let factor = 2_u32.saturating_pow(exponent.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<usize>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the total attempt budget (including the first attempt).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the backoff after the first failure.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set the cap on any single backoff delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`], filling unset fields from the defaults.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, or the attempt budget
/// is exhausted, sleeping the policy's backoff between retryable failures.
///
/// The operation receives the 1-based attempt number, mostly for logging.
///
/// # Errors
///
/// [`RetryError::Fatal`] on the first non-retryable outcome,
/// [`RetryError::Exhausted`] when `max_attempts` retryable failures occurred.
pub async fn run_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Attempt::Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Attempt::Fatal(source) => {
                tracing::warn!(attempt, error = %source, "fatal error, not retrying");
                return Err(RetryError::Fatal { attempt, source });
            }
            Attempt::Retryable(err) => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        attempts = attempt,
                        error = %err,
                        "operation failed, attempt budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                let delay = policy.backoff_after(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "attempt failed, backing off"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn backoff_doubles_per_failed_attempt() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .build();

        // 1s * 2^9 = 512s, but capped at 5s.
        assert_eq!(policy.backoff_after(10), Duration::from_secs(5));
        // Absurd attempt numbers must not overflow.
        assert_eq!(policy.backoff_after(10_000), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = run_with_backoff(&policy, |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Attempt::<_, String>::Ok(7)
            }
        })
        .await;

        assert!(matches!(result, Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_observing_backoff() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(10))
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let started = Instant::now();

        // Down for exactly 2 attempts, succeeds on the 3rd.
        let result = run_with_backoff(&policy, |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Attempt::Retryable(format!("attempt {n} failed"))
                } else {
                    Attempt::Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two backoff delays: 10ms + 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .base_delay(Duration::from_millis(5))
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = run_with_backoff(&policy, |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Attempt::Retryable("still down".to_string())
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(5))
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = run_with_backoff(&policy, |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Attempt::Fatal("bad credentials".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempt: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
