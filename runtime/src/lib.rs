//! # Herald Runtime
//!
//! Failure-handling building blocks for the Herald delivery layer:
//!
//! - [`retry`]: an explicit retry executor with exponential backoff.
//!   Operations return a typed [`retry::Attempt`] outcome
//!   (`Ok | Retryable | Fatal`) instead of driving control flow through
//!   caught exceptions, so backoff decisions stay pure and independently
//!   testable.
//! - [`circuit_breaker`]: a Closed/Open/HalfOpen breaker that makes a
//!   degraded broker fail fast instead of blocking callers on transport
//!   timeouts, and self-heals through a single half-open probe.
//!
//! Both are broker-agnostic; the `herald-amqp` crate composes them around
//! its connection manager and publisher.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State};
pub use retry::{Attempt, RetryError, RetryPolicy, run_with_backoff};
