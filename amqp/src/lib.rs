//! # Herald AMQP
//!
//! The AMQP-facing half of the Herald delivery layer. Domain services hand
//! envelopes to the [`router::DeliveryRouter`]; everything below it exists to
//! get those envelopes onto the broker without hammering it when it is down:
//!
//! ```text
//! ┌────────────────┐
//! │ Domain service │
//! └───────┬────────┘
//!         ▼
//! ┌────────────────┐   publish / batch / send / schedule
//! │ DeliveryRouter │
//! └───────┬────────┘
//!         ▼
//! ┌────────────────┐   fail fast while the broker is degraded
//! │ EventPublisher │◄─── circuit breaker per publish target
//! └───────┬────────┘
//!         ▼
//! ┌───────────────────┐  one shared connection, backoff reconnect
//! │ ConnectionManager │
//! └───────┬───────────┘
//!         ▼
//! ┌────────────────┐
//! │  AMQP broker   │
//! └────────────────┘
//! ```
//!
//! Inbound, [`consume::ConsumerRuntime`] binds a queue to the exchange,
//! decodes deliveries, and drives a `NotificationConsumer` with
//! at-least-once semantics.
//!
//! # Delivery guarantees
//!
//! At-least-once, not exactly-once: there is no transaction spanning the
//! domain write and the publish, and no outbox. A publish that still fails
//! after connection retries and breaker handling is logged and **lost**;
//! callers that cannot tolerate loss must persist their own outbox before
//! calling (known gap, by explicit decision).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use herald_amqp::broker::AmqpTransport;
//! use herald_amqp::config::BrokerConfig;
//! use herald_amqp::connection::ConnectionManager;
//! use herald_amqp::publisher::EventPublisher;
//! use herald_amqp::router::DeliveryRouter;
//! use herald_core::envelope::{Envelope, EventPayload};
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::builder()
//!     .host("broker.internal")
//!     .exchange("bookings.events")
//!     .source_service("booking-service")
//!     .build();
//!
//! let transport = Arc::new(AmqpTransport::new(&config));
//! let connection = Arc::new(ConnectionManager::new(transport, &config));
//! let router = DeliveryRouter::new(EventPublisher::new(connection, &config));
//!
//! let envelope = Envelope::new(
//!     config.source_service.clone(),
//!     None,
//!     EventPayload::BookingCreated {
//!         booking_id: Uuid::new_v4(),
//!         room_id: Uuid::new_v4(),
//!         guest_email: "guest@example.com".to_string(),
//!         starts_at: chrono::Utc::now(),
//!         ends_at: chrono::Utc::now(),
//!     },
//! );
//! router.publish(envelope, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod consume;
pub mod publisher;
pub mod router;

pub use broker::AmqpTransport;
pub use config::BrokerConfig;
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use consume::ConsumerRuntime;
pub use publisher::EventPublisher;
pub use router::{BatchOutcome, BatchReport, DeliveryRouter, ScheduleToken};
