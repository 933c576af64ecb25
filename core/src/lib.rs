//! # Herald Core
//!
//! Core traits and types for the Herald event delivery layer.
//!
//! Herald sits between domain services (bookings, ticketing) and an AMQP
//! broker. This crate defines the pieces every other Herald crate builds on:
//!
//! - **Envelope**: immutable metadata + payload wrapper attached to every
//!   domain event ([`envelope`])
//! - **Codec**: the UTF-8 JSON wire encoding of envelopes ([`codec`])
//! - **Transport**: the seam between Herald and the broker client, so tests
//!   can inject a fake broker ([`transport`])
//! - **Consumer contract**: the boundary interface invoked when a message is
//!   delivered ([`consumer`])
//! - **Error taxonomy**: transient vs fatal failure classes ([`error`])
//!
//! ## Design Principles
//!
//! - Explicitly constructed components, no ambient/global broker state
//! - Closed set of event kinds (an enum, not open-ended generics)
//! - Typed failure outcomes instead of exception-driven control flow
//! - At-least-once delivery: consumers must be idempotent
//!
//! ## Example
//!
//! ```
//! use herald_core::envelope::{Envelope, EventPayload};
//! use herald_core::codec;
//! use uuid::Uuid;
//!
//! let envelope = Envelope::new(
//!     "booking-service",
//!     None,
//!     EventPayload::BookingCancelled {
//!         booking_id: Uuid::new_v4(),
//!         room_id: Uuid::new_v4(),
//!         reason: Some("guest request".to_string()),
//!     },
//! );
//!
//! let bytes = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&bytes).unwrap();
//! assert_eq!(decoded.event_id, envelope.event_id);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

pub mod codec;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod transport;

pub use consumer::NotificationConsumer;
pub use envelope::{Envelope, EventKind, EventPayload};
pub use error::{ConsumerError, DeliveryError, EnvelopeError};
pub use transport::{Transport, TransportChannel, TransportConnection, TransportError};
