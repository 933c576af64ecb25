//! Error taxonomy for the delivery layer.
//!
//! Failures fall into four classes with different handling policies:
//!
//! - **Transient-connection**: broker unreachable or refusing connections;
//!   retried with exponential backoff, exhaustion surfaces as
//!   [`DeliveryError::NoConnection`].
//! - **Transient-publish**: channel or publish failure while connected;
//!   counted toward the circuit-breaker threshold, never locally retried.
//! - **Breaker-open rejection**: [`DeliveryError::CircuitOpen`], distinct so
//!   callers can tell "broker is down, don't bother" from "this one publish
//!   failed".
//! - **Serialization/programming errors**: [`EnvelopeError`]; fatal,
//!   propagated immediately, never retried.
//!
//! The router never swallows a failure: callers decide per event criticality
//! whether to log-and-continue or fail the originating request.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors in envelope encoding and decoding. Always fatal; never retried.
#[derive(Error, Debug, Clone)]
pub enum EnvelopeError {
    /// The envelope could not be serialized to the wire format.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The wire bytes could not be parsed back into an envelope.
    #[error("failed to decode envelope: {0}")]
    Decode(String),

    /// The payload discriminator names a kind outside the closed set.
    #[error("unknown event kind tag '{0}'")]
    UnknownKind(String),
}

/// Errors surfaced by the delivery layer to publishing and consuming callers.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// No broker connection could be established within the retry budget.
    #[error("no broker connection after {attempts} attempt(s): {reason}")]
    NoConnection {
        /// Connect attempts made before giving up.
        attempts: usize,
        /// The last connection error observed.
        reason: String,
    },

    /// The circuit breaker for this publish target is open; the transport
    /// was not touched.
    #[error("circuit breaker open for target '{target}'")]
    CircuitOpen {
        /// The exchange (or `queue:<name>` destination) that is failing.
        target: String,
    },

    /// A transport-level failure while connected.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A fatal envelope serialization problem.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The caller cancelled before the message was handed to the transport.
    /// Once bytes are written, cancellation can no longer retract a publish.
    #[error("publish cancelled before hand-off to transport")]
    Cancelled,
}

impl DeliveryError {
    /// Whether this failure class may succeed on a later attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoConnection { .. } | Self::CircuitOpen { .. } | Self::Transport(_)
        )
    }
}

/// Error raised by a [`crate::consumer::NotificationConsumer`].
///
/// The consumer runtime re-raises this to the broker's redelivery machinery
/// by negatively acknowledging the message with requeue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification handler failed: {0}")]
pub struct ConsumerError(String);

impl ConsumerError {
    /// Wrap a handler failure description.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
