//! # Herald Testing
//!
//! Test doubles for the Herald delivery layer.
//!
//! This crate provides deterministic fakes for the two seams Herald exposes:
//!
//! - [`transport::FakeTransport`]: an in-memory broker standing in for the
//!   AMQP client: scriptable connect and publish failures, full capture of
//!   declared exchanges/queues/bindings and published messages (properties
//!   included), injectable inbound deliveries, and ack/requeue recording.
//! - [`consumer::RecordingConsumer`]: a [`NotificationConsumer`] that
//!   captures every envelope it is handed and answers from a script.
//!
//! [`NotificationConsumer`]: herald_core::consumer::NotificationConsumer

pub mod consumer;
pub mod transport;

pub use consumer::RecordingConsumer;
pub use transport::{AckOutcome, FakeTransport, PublishedMessage};
