//! Transport abstraction between Herald and the broker client.
//!
//! The connection manager, publisher, and consumer runtime are written
//! against these traits rather than a concrete broker client, so tests can
//! inject a fake broker and the production AMQP client stays confined to one
//! adapter module.
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` (via [`BoxFuture`]) instead
//! of `async fn` so the traits are usable as trait objects
//! (`Arc<dyn Transport>`). Implementations clone borrowed arguments before
//! entering their async blocks; the returned future only borrows `self`.

use std::sync::Arc;

use futures::Stream;
use futures::future::BoxFuture;
use std::pin::Pin;
use thiserror::Error;

use crate::envelope::Envelope;

/// Content type tag for the JSON wire body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Header carrying the producing service name.
pub const HEADER_SOURCE_SERVICE: &str = "X-Source-Service";
/// Header carrying the payload schema version.
pub const HEADER_SCHEMA_VERSION: &str = "X-Schema-Version";
/// Header carrying the event kind wire tag.
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";

/// Transport-level failures, classified so the retry executor can tell
/// which connection errors are worth retrying.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The broker host could not be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker actively refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// A channel could not be created or used.
    #[error("channel error: {0}")]
    Channel(String),

    /// A publish was attempted and failed at the broker.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A consume operation failed.
    #[error("consume failed: {0}")]
    Consume(String),
}

impl TransportError {
    /// Whether this is a transient connection-establishment failure.
    ///
    /// Only unreachable/refused classes are retried by the connect loop; all
    /// other errors propagate to the caller.
    #[must_use]
    pub const fn is_transient_connect(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Refused(_))
    }
}

/// Wire-level message properties attached to every publish.
///
/// Mirrors the AMQP basic properties Herald sets: `message-id`, `timestamp`,
/// `correlation-id`, `type`, `content-type`, `delivery-mode`, plus the custom
/// `X-*` headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageProperties {
    /// The envelope's event id, as the AMQP `message-id`.
    pub message_id: String,
    /// The envelope's correlation id.
    pub correlation_id: String,
    /// Envelope timestamp as seconds since the Unix epoch.
    pub timestamp_epoch_secs: u64,
    /// Event kind wire tag, as the AMQP `type` property.
    pub event_type: String,
    /// Body content type ([`CONTENT_TYPE_JSON`]).
    pub content_type: String,
    /// Whether the broker should persist the message (delivery-mode 2).
    pub persistent: bool,
    /// Custom string headers, in insertion order.
    pub headers: Vec<(String, String)>,
}

impl MessageProperties {
    /// Build the standard property set for an envelope.
    #[must_use]
    pub fn for_envelope(envelope: &Envelope) -> Self {
        let kind_tag = envelope.kind().wire_tag();
        Self {
            message_id: envelope.event_id.to_string(),
            correlation_id: envelope.correlation_id.clone(),
            timestamp_epoch_secs: u64::try_from(envelope.timestamp.timestamp()).unwrap_or(0),
            event_type: kind_tag.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            headers: vec![
                (
                    HEADER_SOURCE_SERVICE.to_string(),
                    envelope.source_service.clone(),
                ),
                (
                    HEADER_SCHEMA_VERSION.to_string(),
                    envelope.schema_version.clone(),
                ),
                (HEADER_EVENT_TYPE.to_string(), kind_tag.to_string()),
            ],
        }
    }
}

/// Declaration parameters for the publish target exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Deleted when the last binding goes away.
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// The standard Herald exchange shape: direct, durable, not auto-deleted.
    #[must_use]
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

/// Connection-level events observed on an open broker connection.
///
/// These are logged and forwarded to registered observers; they never trigger
/// reconnection themselves. Reconnection is attempt-driven, the next time a
/// caller needs a channel.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// The connection shut down (broker-initiated or network failure).
    Shutdown {
        /// Broker- or client-supplied close reason.
        reason: String,
    },
    /// The broker paused the connection (e.g. resource alarm).
    Blocked {
        /// Broker-supplied reason.
        reason: String,
    },
    /// The broker resumed a previously blocked connection.
    Unblocked,
    /// A client-side callback raised an error.
    CallbackError {
        /// Description of the callback failure.
        detail: String,
    },
}

/// Observer callback for [`ConnectionEvent`]s.
pub type ConnectionEventCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Acknowledgement handle for one inbound delivery.
pub trait Acker: Send {
    /// Acknowledge the delivery; the broker will not redeliver it.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Negatively acknowledge with requeue; the broker redelivers the
    /// message (at-least-once semantics).
    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// One message received from the broker, with its acknowledgement handle.
pub struct Delivery {
    /// Raw message body.
    pub body: Vec<u8>,
    /// Handle used to ack or requeue this delivery.
    pub acker: Box<dyn Acker>,
}

/// Stream of inbound deliveries from a consume operation.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// Factory for broker connections.
pub trait Transport: Send + Sync {
    /// Open one connection to the broker.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] whose `is_transient_connect` flag tells
    /// the caller whether retrying makes sense.
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn TransportConnection>, TransportError>>;
}

/// One open broker connection. Channels are created per publish because the
/// underlying channel objects are not safe for concurrent use.
pub trait TransportConnection: Send + Sync {
    /// Create a fresh channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Channel`] if the connection cannot serve a
    /// channel (typically because it has died since the last health check).
    fn create_channel(&self) -> BoxFuture<'_, Result<Box<dyn TransportChannel>, TransportError>>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Register an observer for connection-level events.
    fn on_event(&self, callback: ConnectionEventCallback);
}

/// One channel on a broker connection. Owned by a single publish or consume
/// operation at a time; never shared across concurrent publishes.
pub trait TransportChannel: Send + Sync {
    /// Idempotently declare the target exchange.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Channel`] on declaration failure.
    fn declare_exchange(&self, spec: &ExchangeSpec) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Idempotently declare a durable queue.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Channel`] on declaration failure.
    fn declare_queue(&self, name: &str) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Bind a queue to an exchange for one routing key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Channel`] on binding failure.
    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Publish a message body with the given properties.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Publish`] if the broker did not accept the
    /// message.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Start consuming from a queue.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Consume`] if the consumer could not be
    /// registered.
    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BoxFuture<'_, Result<DeliveryStream, TransportError>>;

    /// Release the channel back to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Channel`] if the close handshake failed;
    /// callers may ignore this after a successful publish.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EventPayload};
    use uuid::Uuid;

    #[test]
    fn properties_carry_envelope_metadata_and_headers() {
        let envelope = Envelope::new(
            "ticket-service",
            Some("corr-42".to_string()),
            EventPayload::TicketAssigned {
                ticket_id: Uuid::new_v4(),
                assignee_id: Uuid::new_v4(),
            },
        );

        let props = MessageProperties::for_envelope(&envelope);

        assert_eq!(props.message_id, envelope.event_id.to_string());
        assert_eq!(props.correlation_id, "corr-42");
        assert_eq!(props.event_type, "ticket.assigned");
        assert_eq!(props.content_type, CONTENT_TYPE_JSON);
        assert!(props.persistent);
        assert_eq!(
            props.timestamp_epoch_secs,
            u64::try_from(envelope.timestamp.timestamp()).unwrap_or(0)
        );
        assert_eq!(
            props.headers,
            vec![
                (HEADER_SOURCE_SERVICE.to_string(), "ticket-service".to_string()),
                (HEADER_SCHEMA_VERSION.to_string(), "1.0.0".to_string()),
                (HEADER_EVENT_TYPE.to_string(), "ticket.assigned".to_string()),
            ]
        );
    }

    #[test]
    fn direct_exchange_spec_defaults() {
        let spec = ExchangeSpec::direct("herald.events");
        assert!(spec.durable);
        assert!(!spec.auto_delete);
    }

    #[test]
    fn transient_connect_classification() {
        assert!(TransportError::Unreachable("x".to_string()).is_transient_connect());
        assert!(TransportError::Refused("x".to_string()).is_transient_connect());
        assert!(!TransportError::Channel("x".to_string()).is_transient_connect());
        assert!(!TransportError::Publish("x".to_string()).is_transient_connect());
    }
}
