//! Circuit-breaker publisher.
//!
//! Every publish runs through a [`CircuitBreaker`] keyed by its target, so a
//! failing exchange trips its own circuit without affecting point-to-point
//! queue sends (and vice versa). While a target's circuit is open, publishes
//! to it fail fast with [`DeliveryError::CircuitOpen`] and never touch the
//! transport.
//!
//! Serialization happens before the breaker: an envelope that cannot be
//! encoded is a programming error, not a broker failure, and must not count
//! toward opening the circuit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use herald_core::codec;
use herald_core::envelope::Envelope;
use herald_core::error::DeliveryError;
use herald_core::transport::{ExchangeSpec, MessageProperties};
use herald_runtime::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State,
};

use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;

/// Where one message is going.
enum Target<'a> {
    /// The shared direct exchange, with an explicit routing key.
    Exchange { routing_key: &'a str },
    /// A named queue via the default exchange (point-to-point).
    Queue { name: &'a str },
}

impl Target<'_> {
    /// Breaker key and log label for this destination.
    fn label(&self, exchange: &ExchangeSpec) -> String {
        match self {
            Self::Exchange { .. } => exchange.name.clone(),
            Self::Queue { name } => format!("queue:{name}"),
        }
    }
}

/// Publishes envelopes through per-target circuit breakers.
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    exchange: ExchangeSpec,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl EventPublisher {
    /// Create a publisher targeting the configured exchange.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, config: &BrokerConfig) -> Self {
        Self {
            connection,
            exchange: ExchangeSpec::direct(config.exchange.clone()),
            breaker_config: config.breaker_config(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an envelope to the shared exchange.
    ///
    /// The routing key defaults to the event kind's wire tag; pass
    /// `routing_key` to override it.
    ///
    /// # Errors
    ///
    /// See [`DeliveryError`]; notably [`DeliveryError::CircuitOpen`] when the
    /// exchange's circuit is failing fast.
    pub async fn publish(
        &self,
        envelope: &Envelope,
        routing_key: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let routing_key = routing_key.unwrap_or_else(|| envelope.kind().wire_tag());
        self.dispatch(envelope, Target::Exchange { routing_key })
            .await
    }

    /// Send an envelope directly to a named queue, bypassing the exchange.
    ///
    /// The queue is declared durable before the send, so the message is not
    /// lost when no consumer has declared it yet.
    ///
    /// # Errors
    ///
    /// See [`DeliveryError`]. The queue has its own circuit, keyed
    /// `queue:<name>`.
    pub async fn send_to_queue(
        &self,
        envelope: &Envelope,
        queue: &str,
    ) -> Result<(), DeliveryError> {
        self.dispatch(envelope, Target::Queue { name: queue }).await
    }

    /// Circuit state for a publish target, if any publish has targeted it.
    pub async fn breaker_state(&self, target: &str) -> Option<State> {
        let breaker = lock(&self.breakers).get(target).cloned();
        match breaker {
            Some(breaker) => Some(breaker.state().await),
            None => None,
        }
    }

    /// The connection manager backing this publisher.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    async fn dispatch(&self, envelope: &Envelope, target: Target<'_>) -> Result<(), DeliveryError> {
        let body = codec::encode(envelope)?;
        let properties = MessageProperties::for_envelope(envelope);
        let label = target.label(&self.exchange);

        let result = self
            .breaker_for(&label)
            .call(|| self.transmit(&target, properties, body))
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(CircuitBreakerError::Open) => {
                tracing::warn!(
                    destination = %label,
                    event_id = %envelope.event_id,
                    "circuit open, publish rejected"
                );
                Err(DeliveryError::CircuitOpen { target: label })
            }
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }

    async fn transmit(
        &self,
        target: &Target<'_>,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let channel = self.connection.create_channel().await?;

        let (exchange, routing_key) = match target {
            Target::Exchange { routing_key } => {
                channel.declare_exchange(&self.exchange).await?;
                (self.exchange.name.as_str(), *routing_key)
            }
            Target::Queue { name } => {
                channel.declare_queue(name).await?;
                ("", *name)
            }
        };

        let publish_result = channel.publish(exchange, routing_key, properties, body).await;
        // The channel is released either way; a close failure after a
        // successful publish is not a delivery failure.
        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "channel close failed after publish");
        }
        publish_result.map_err(DeliveryError::from)
    }

    fn breaker_for(&self, target: &str) -> CircuitBreaker {
        lock(&self.breakers)
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()))
            .clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::envelope::EventPayload;
    use herald_core::transport::{HEADER_EVENT_TYPE, Transport};
    use herald_testing::FakeTransport;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_config() -> BrokerConfig {
        BrokerConfig::builder()
            .exchange("herald.events")
            .retry_count(1)
            .retry_base_delay(Duration::from_millis(1))
            .failure_threshold(3)
            .break_duration(Duration::from_millis(50))
            .build()
    }

    fn publisher(transport: &Arc<FakeTransport>) -> EventPublisher {
        let config = test_config();
        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            &config,
        ));
        EventPublisher::new(connection, &config)
    }

    fn reminder() -> Envelope {
        Envelope::new(
            "booking-service",
            None,
            EventPayload::BookingReminder {
                booking_id: Uuid::new_v4(),
                guest_email: "guest@example.com".to_string(),
                starts_at: chrono::Utc::now(),
            },
        )
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn publish_routes_by_kind_with_full_properties() {
        let transport = Arc::new(FakeTransport::new());
        let publisher = publisher(&transport);
        let envelope = reminder();

        publisher
            .publish(&envelope, None)
            .await
            .expect("publish should succeed");

        let published = transport.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.exchange, "herald.events");
        assert_eq!(message.routing_key, "booking.reminder");
        assert_eq!(message.properties.message_id, envelope.event_id.to_string());
        assert!(message.properties.persistent);
        assert!(
            message
                .properties
                .headers
                .contains(&(HEADER_EVENT_TYPE.to_string(), "booking.reminder".to_string()))
        );

        // The exchange was declared and the channel released.
        assert_eq!(transport.declared_exchanges().len(), 1);
        assert_eq!(transport.channels_closed(), transport.channels_opened());
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn routing_key_override_wins_over_kind_tag() {
        let transport = Arc::new(FakeTransport::new());
        let publisher = publisher(&transport);

        publisher
            .publish(&reminder(), Some("reminders.priority"))
            .await
            .expect("publish should succeed");

        assert_eq!(transport.published()[0].routing_key, "reminders.priority");
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn queue_send_uses_default_exchange_and_declares_queue() {
        let transport = Arc::new(FakeTransport::new());
        let publisher = publisher(&transport);

        publisher
            .send_to_queue(&reminder(), "booking-reminders")
            .await
            .expect("send should succeed");

        let message = &transport.published()[0];
        assert_eq!(message.exchange, "");
        assert_eq!(message.routing_key, "booking-reminders");
        assert_eq!(transport.declared_queues(), vec!["booking-reminders"]);
        assert!(transport.declared_exchanges().is_empty());
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_rejects_without_transport() {
        let transport = Arc::new(FakeTransport::new());
        let publisher = publisher(&transport);
        transport.fail_next_publishes(3);

        for _ in 0..3 {
            let result = publisher.publish(&reminder(), None).await;
            assert!(matches!(result, Err(DeliveryError::Transport(_))));
        }
        assert_eq!(
            publisher.breaker_state("herald.events").await,
            Some(State::Open)
        );

        let attempts_before = transport.publish_attempts();
        let result = publisher.publish(&reminder(), None).await;
        assert!(matches!(
            result,
            Err(DeliveryError::CircuitOpen { target }) if target == "herald.events"
        ));
        assert_eq!(transport.publish_attempts(), attempts_before);
    }

    #[tokio::test]
    async fn probe_after_cooldown_closes_the_circuit() {
        let transport = Arc::new(FakeTransport::new());
        let publisher = publisher(&transport);
        transport.fail_next_publishes(3);

        for _ in 0..3 {
            let _ = publisher.publish(&reminder(), None).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(publisher.publish(&reminder(), None).await.is_ok());
        assert_eq!(
            publisher.breaker_state("herald.events").await,
            Some(State::Closed)
        );
    }

    #[tokio::test]
    async fn queue_target_failures_do_not_trip_the_exchange_circuit() {
        let transport = Arc::new(FakeTransport::new());
        let publisher = publisher(&transport);
        transport.fail_next_publishes(3);

        for _ in 0..3 {
            let _ = publisher.send_to_queue(&reminder(), "dead-letter").await;
        }
        assert_eq!(
            publisher.breaker_state("queue:dead-letter").await,
            Some(State::Open)
        );

        assert!(publisher.publish(&reminder(), None).await.is_ok());
        assert_eq!(
            publisher.breaker_state("herald.events").await,
            Some(State::Closed)
        );
    }
}
