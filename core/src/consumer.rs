//! Notification consumer contract.
//!
//! This is the boundary interface the delivery layer calls *into* when a
//! message arrives: Herald decodes the envelope, hands it to the consumer,
//! and routes the outcome back to the broker's acknowledgement machinery.
//! The implementations live outside Herald (email senders, webhooks, ...).
//!
//! # At-least-once
//!
//! Unacknowledged messages are redelivered, so handlers must be idempotent.
//! A returned [`ConsumerError`] is re-raised to the broker as a negative
//! acknowledgement with requeue; `Ok(false)` (handler completed but the side
//! effect reported failure) is acknowledged with a warning, so a permanently
//! failing side effect does not loop forever.

use futures::future::BoxFuture;

use crate::envelope::{Envelope, EventKind};
use crate::error::ConsumerError;

/// External handler for delivered notifications.
///
/// Implementations clone what they need from the envelope before entering
/// their async block; the returned future only borrows `self`.
pub trait NotificationConsumer: Send + Sync {
    /// The event kinds this consumer wants bound to its queue.
    fn kinds(&self) -> &[EventKind];

    /// Handle one delivered envelope.
    ///
    /// Returns whether the side effect succeeded. The envelope is fully
    /// decoded and schema-versioned before this is invoked.
    ///
    /// # Errors
    ///
    /// A [`ConsumerError`] makes the runtime requeue the message for
    /// redelivery.
    fn handle(&self, envelope: &Envelope) -> BoxFuture<'_, Result<bool, ConsumerError>>;
}
