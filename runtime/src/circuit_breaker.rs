//! Circuit breaker guarding a publish target.
//!
//! When the broker degrades, every publish would otherwise block on transport
//! timeouts. The breaker counts consecutive failures and, past a threshold,
//! rejects calls immediately for a cooldown period, then self-heals through a
//! single probing call.
//!
//! # States
//!
//! - **Closed**: calls pass through; each failure increments the consecutive
//!   failure counter, each success resets it. Reaching the threshold opens
//!   the circuit.
//! - **Open**: calls are rejected without touching the dependency until
//!   `break_duration` has elapsed since `opened_at`. The first call at or
//!   after that boundary is admitted as the probe.
//! - **HalfOpen**: exactly one probe is in flight; concurrent calls are
//!   rejected. Probe success closes the circuit and resets the counter;
//!   probe failure re-opens it with a fresh timer.
//!
//! # Example
//!
//! ```rust
//! use herald_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(3)
//!         .break_duration(Duration::from_secs(30))
//!         .build(),
//! );
//!
//! match breaker.call(|| async { Ok::<_, String>(()) }).await {
//!     Ok(()) => {}
//!     Err(e) => eprintln!("publish failed: {e}"),
//! }
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// How long the circuit stays open before admitting a probe.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            break_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            break_duration: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    break_duration: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set how many consecutive failures open the circuit.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open before a probe is admitted.
    #[must_use]
    pub const fn break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = Some(duration);
        self
    }

    /// Build the configuration, filling unset fields from the defaults.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold).max(1),
            break_duration: self.break_duration.unwrap_or(defaults.break_duration),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Normal operation; calls pass through.
    Closed,
    /// Failing fast; calls are rejected without touching the dependency.
    Open,
    /// One probe in flight, testing whether the dependency recovered.
    HalfOpen,
}

/// Errors from calls made through the breaker.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open (or a probe is already in flight); the operation
    /// was not invoked.
    #[error("circuit breaker is open")]
    Open,
    /// The operation was invoked and failed.
    #[error("operation failed: {0}")]
    Inner(E),
}

/// How a call was admitted; decides which transition its outcome drives.
#[derive(Clone, Copy)]
enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

/// Point-in-time view of breaker state, for logging and assertions.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: State,
    /// Current consecutive failure count.
    pub consecutive_failures: usize,
}

/// Counters accumulated over the breaker's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Calls attempted, admitted or not.
    pub total_calls: u64,
    /// Admitted calls that succeeded.
    pub total_successes: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
}

/// A stateful guard that stops calls to a failing dependency for a cooldown
/// period. One instance guards one logical publish target.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<RwLock<Inner>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(RwLock::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state of the breaker.
    pub async fn state(&self) -> State {
        self.inner.read().await.state
    }

    /// Current state and failure counter.
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.read().await;
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Lifetime counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Run an operation through the breaker.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] if the call was rejected without
    /// invoking the operation; [`CircuitBreakerError::Inner`] if the
    /// operation ran and failed.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.try_admit().await else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("circuit breaker is open, rejecting call");
            return Err(CircuitBreakerError::Open);
        };

        match operation().await {
            Ok(value) => {
                self.on_success(admission).await;
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(admission).await;
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Force the breaker back to closed. For tests and manual intervention.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        tracing::info!("circuit breaker manually reset to CLOSED");
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Decide whether a call may proceed, transitioning Open to HalfOpen when
    /// the break duration has elapsed. HalfOpen means a probe is already in
    /// flight, so further calls are rejected.
    async fn try_admit(&self) -> Option<Admission> {
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Closed => Some(Admission::Normal),
            State::HalfOpen => None,
            State::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.break_duration);
                if cooled_down {
                    tracing::info!("circuit breaker transitioning OPEN -> HALF_OPEN (probe)");
                    inner.state = State::HalfOpen;
                    Some(Admission::Probe)
                } else {
                    None
                }
            }
        }
    }

    async fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.write().await;
        match admission {
            Admission::Normal => {
                inner.consecutive_failures = 0;
            }
            Admission::Probe => {
                tracing::info!("circuit breaker probe succeeded, HALF_OPEN -> CLOSED");
                inner.state = State::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
        }
    }

    async fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.write().await;
        match admission {
            Admission::Normal => {
                inner.consecutive_failures += 1;
                if inner.state == State::Closed
                    && inner.consecutive_failures >= self.config.failure_threshold
                {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker transitioning CLOSED -> OPEN"
                    );
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            Admission::Probe => {
                tracing::warn!("circuit breaker probe failed, HALF_OPEN -> OPEN");
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: usize, break_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .break_duration(Duration::from_millis(break_ms))
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let breaker = breaker(3, 100);
        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
        assert!(matches!(result, Ok(42)));
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let breaker = breaker(3, 100);
        fail(&breaker).await;
        fail(&breaker).await;
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.state, State::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, 100);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn rejects_without_invoking_operation_while_open() {
        let breaker = breaker(2, 10_000);
        for _ in 0..2 {
            fail(&breaker).await;
        }

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let result = breaker
            .call(|| {
                let invoked = Arc::clone(&invoked_clone);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[tokio::test]
    async fn admits_a_probe_after_break_duration() {
        let breaker = breaker(2, 50);
        for _ in 0..2 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.snapshot().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn probe_failure_reopens_with_fresh_timer() {
        let breaker = breaker(2, 50);
        for _ in 0..2 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&breaker).await; // the probe
        assert_eq!(breaker.state().await, State::Open);

        // Fresh timer: still rejecting right after the failed probe.
        let result = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn only_one_probe_is_admitted() {
        let breaker = breaker(1, 20);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // First call becomes the probe and holds the half-open slot.
        let slow_probe = breaker.call(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(())
        });
        let concurrent = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            breaker.call(|| async { Ok::<_, String>(()) }).await
        };

        let (probe_result, concurrent_result) = tokio::join!(slow_probe, concurrent);
        assert!(probe_result.is_ok());
        assert!(matches!(concurrent_result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let breaker = breaker(1, 10_000);
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);

        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn counts_calls_successes_and_failures() {
        let breaker = breaker(10, 100);
        for _ in 0..3 {
            let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        }
        for _ in 0..2 {
            fail(&breaker).await;
        }

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 5);
        assert_eq!(metrics.total_successes, 3);
        assert_eq!(metrics.total_failures, 2);
        assert_eq!(metrics.total_rejections, 0);
    }
}
