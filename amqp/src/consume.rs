//! Consumer runtime: drives a [`NotificationConsumer`] from a queue.
//!
//! The runtime declares the topology (exchange, durable queue, one binding
//! per event kind the consumer cares about), then loops over deliveries:
//! decode, hand to the consumer, settle. Settlement policy:
//!
//! - handler returned `Ok(true)`: ack;
//! - handler returned `Ok(false)` (ran, but the side effect was not
//!   performed): ack with a warning; redelivery would not change the answer;
//! - handler returned `Err`: nack with requeue, the broker redelivers
//!   (at-least-once, so handlers must be idempotent);
//! - body failed to decode: ack and drop after an error log; requeueing a
//!   poison message would spin forever.

use std::sync::Arc;

use futures::StreamExt;
use herald_core::codec;
use herald_core::consumer::NotificationConsumer;
use herald_core::error::DeliveryError;
use herald_core::transport::{Delivery, ExchangeSpec};

use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;

/// Binds a queue to the exchange and pumps deliveries into a consumer.
pub struct ConsumerRuntime {
    connection: Arc<ConnectionManager>,
    exchange: ExchangeSpec,
}

impl ConsumerRuntime {
    /// Create a runtime consuming from the configured exchange.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, config: &BrokerConfig) -> Self {
        Self {
            connection,
            exchange: ExchangeSpec::direct(config.exchange.clone()),
        }
    }

    /// Consume from `queue` until the delivery stream ends.
    ///
    /// Declares the exchange and a durable queue, binds the queue for each of
    /// the consumer's event kinds, then processes deliveries one at a time,
    /// in order. Returns when the broker closes the stream.
    ///
    /// # Errors
    ///
    /// [`DeliveryError`] if the topology could not be declared or the
    /// consumer could not be registered. Per-message failures are settled on
    /// the message, never returned.
    pub async fn run(
        &self,
        queue: &str,
        consumer: Arc<dyn NotificationConsumer>,
    ) -> Result<(), DeliveryError> {
        let channel = self.connection.create_channel().await?;
        channel.declare_exchange(&self.exchange).await?;
        channel.declare_queue(queue).await?;
        for kind in consumer.kinds() {
            channel
                .bind_queue(queue, &self.exchange.name, kind.wire_tag())
                .await?;
        }

        let consumer_tag = format!("herald-{queue}");
        let mut deliveries = channel.consume(queue, &consumer_tag).await?;
        tracing::info!(queue, kinds = consumer.kinds().len(), "consumer started");

        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => handle_delivery(delivery, consumer.as_ref()).await,
                Err(err) => tracing::error!(queue, error = %err, "delivery stream error"),
            }
        }

        tracing::info!(queue, "consumer stream ended");
        Ok(())
    }
}

async fn handle_delivery(delivery: Delivery, consumer: &dyn NotificationConsumer) {
    let envelope = match codec::decode(&delivery.body) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::error!(error = %err, "dropping undecodable delivery");
            settle(delivery.acker.ack().await);
            return;
        }
    };

    tracing::debug!(
        kind = %envelope.kind(),
        event_id = %envelope.event_id,
        correlation_id = %envelope.correlation_id,
        "handling delivery"
    );

    match consumer.handle(&envelope).await {
        Ok(true) => settle(delivery.acker.ack().await),
        Ok(false) => {
            tracing::warn!(
                event_id = %envelope.event_id,
                "handler completed without performing the side effect"
            );
            settle(delivery.acker.ack().await);
        }
        Err(err) => {
            tracing::warn!(
                event_id = %envelope.event_id,
                error = %err,
                "handler failed, requeueing for redelivery"
            );
            settle(delivery.acker.requeue().await);
        }
    }
}

fn settle(result: Result<(), herald_core::transport::TransportError>) {
    if let Err(err) = result {
        tracing::error!(error = %err, "failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::envelope::{Envelope, EventKind, EventPayload};
    use herald_core::error::ConsumerError;
    use herald_core::transport::Transport;
    use herald_testing::{AckOutcome, FakeTransport, RecordingConsumer};
    use std::time::Duration;
    use uuid::Uuid;

    fn runtime(transport: &Arc<FakeTransport>) -> ConsumerRuntime {
        let config = BrokerConfig::builder()
            .exchange("herald.events")
            .retry_count(1)
            .retry_base_delay(Duration::from_millis(1))
            .build();
        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            &config,
        ));
        ConsumerRuntime::new(connection, &config)
    }

    fn ticket_created() -> Envelope {
        Envelope::new(
            "ticket-service",
            None,
            EventPayload::TicketCreated {
                ticket_id: Uuid::new_v4(),
                author_id: Uuid::new_v4(),
                title: "cannot log in".to_string(),
            },
        )
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn binds_the_queue_for_each_consumer_kind() {
        let transport = Arc::new(FakeTransport::new());
        let runtime = runtime(&transport);
        let consumer = Arc::new(RecordingConsumer::new(vec![
            EventKind::TicketCreated,
            EventKind::TicketAssigned,
        ]));

        transport.finish_deliveries();
        runtime
            .run("ticket-notifications", consumer)
            .await
            .expect("run should finish cleanly");

        assert_eq!(transport.declared_queues(), vec!["ticket-notifications"]);
        assert_eq!(
            transport.bindings(),
            vec![
                (
                    "ticket-notifications".to_string(),
                    "herald.events".to_string(),
                    "ticket.created".to_string()
                ),
                (
                    "ticket-notifications".to_string(),
                    "herald.events".to_string(),
                    "ticket.assigned".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn acks_on_success_and_requeues_on_handler_failure() {
        let transport = Arc::new(FakeTransport::new());
        let runtime = runtime(&transport);
        let consumer = Arc::new(RecordingConsumer::new(vec![EventKind::TicketCreated]));
        consumer.respond_with(Ok(true));
        consumer.respond_with(Err(ConsumerError::new("smtp down")));

        let first = codec::encode(&ticket_created()).expect("encode should succeed");
        let second = codec::encode(&ticket_created()).expect("encode should succeed");
        transport.inject_delivery(first, "first");
        transport.inject_delivery(second, "second");
        transport.finish_deliveries();

        runtime
            .run(
                "ticket-notifications",
                Arc::clone(&consumer) as Arc<dyn NotificationConsumer>,
            )
            .await
            .expect("run should finish cleanly");

        assert_eq!(consumer.handled().len(), 2);
        assert_eq!(
            transport.acks(),
            vec![
                ("first".to_string(), AckOutcome::Acked),
                ("second".to_string(), AckOutcome::Requeued),
            ]
        );
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn side_effect_not_performed_is_acked_not_requeued() {
        let transport = Arc::new(FakeTransport::new());
        let runtime = runtime(&transport);
        let consumer = Arc::new(RecordingConsumer::new(vec![EventKind::TicketCreated]));
        consumer.respond_with(Ok(false));

        let body = codec::encode(&ticket_created()).expect("encode should succeed");
        transport.inject_delivery(body, "skipped");
        transport.finish_deliveries();

        runtime
            .run("ticket-notifications", consumer)
            .await
            .expect("run should finish cleanly");

        assert_eq!(
            transport.acks(),
            vec![("skipped".to_string(), AckOutcome::Acked)]
        );
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn undecodable_bodies_are_dropped_without_reaching_the_consumer() {
        let transport = Arc::new(FakeTransport::new());
        let runtime = runtime(&transport);
        let consumer = Arc::new(RecordingConsumer::new(vec![EventKind::TicketCreated]));

        transport.inject_delivery(b"{ not an envelope".to_vec(), "poison");
        transport.finish_deliveries();

        runtime
            .run(
                "ticket-notifications",
                Arc::clone(&consumer) as Arc<dyn NotificationConsumer>,
            )
            .await
            .expect("run should finish cleanly");

        assert!(consumer.handled().is_empty());
        assert_eq!(
            transport.acks(),
            vec![("poison".to_string(), AckOutcome::Acked)]
        );
    }
}
