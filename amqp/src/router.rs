//! Delivery router: the single entry point domain services publish through.
//!
//! The router owns no domain state. It stamps correlation ids, logs every
//! call and its outcome, fans batches out sequentially, and runs scheduled
//! publishes on spawned tokio tasks. Everything below it (breakers,
//! connection retries) lives in the publisher and connection manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::envelope::Envelope;
use herald_core::error::DeliveryError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::publisher::EventPublisher;

/// Handle for one pending scheduled publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleToken {
    /// Identifies the schedule for [`DeliveryRouter::cancel`].
    pub token_id: Uuid,
}

/// Per-event outcome of a batch publish.
#[derive(Debug)]
pub struct BatchOutcome {
    /// The event the outcome belongs to.
    pub event_id: Uuid,
    /// Whether this event was delivered.
    pub result: Result<(), DeliveryError>,
}

/// Result of [`DeliveryRouter::publish_batch`]: one outcome per input event,
/// in input order. Batches are not atomic; partial success is normal.
#[derive(Debug)]
pub struct BatchReport {
    /// Outcomes in input order.
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    /// Number of events delivered.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count()
    }

    /// Number of events that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Whether every event in the batch was delivered.
    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.failed() == 0
    }
}

struct RouterInner {
    publisher: EventPublisher,
    schedules: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// Routes envelopes to the exchange, to named queues, and to the future.
///
/// Cheap to clone; clones share the publisher and the schedule table.
#[derive(Clone)]
pub struct DeliveryRouter {
    inner: Arc<RouterInner>,
}

impl DeliveryRouter {
    /// Create a router over a publisher.
    #[must_use]
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                publisher,
                schedules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Broadcast an envelope to the exchange.
    ///
    /// The effective correlation id is the explicit argument when given,
    /// otherwise the envelope's own.
    ///
    /// # Errors
    ///
    /// See [`DeliveryError`].
    pub async fn publish(
        &self,
        envelope: Envelope,
        correlation_id: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.publish_with_cancel(envelope, correlation_id, &CancellationToken::new())
            .await
    }

    /// [`Self::publish`] with cooperative cancellation.
    ///
    /// Cancellation is checked before the transport write; once bytes are
    /// handed to the transport the publish is not retracted.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Cancelled`] when `cancel` fired first; otherwise as
    /// [`Self::publish`].
    pub async fn publish_with_cancel(
        &self,
        envelope: Envelope,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        if cancel.is_cancelled() {
            tracing::info!(event_id = %envelope.event_id, "publish cancelled before hand-off");
            return Err(DeliveryError::Cancelled);
        }
        let envelope = match correlation_id {
            Some(id) => envelope.with_correlation_id(id),
            None => envelope,
        };
        tracing::info!(
            kind = %envelope.kind(),
            event_id = %envelope.event_id,
            correlation_id = %envelope.correlation_id,
            "publishing event"
        );
        let result = self.inner.publisher.publish(&envelope, None).await;
        log_outcome(&envelope, &result);
        result
    }

    /// Publish a batch of envelopes sequentially, preserving input order.
    ///
    /// A failure does not stop later events; the report carries one outcome
    /// per event. There is no atomicity across the batch.
    pub async fn publish_batch(
        &self,
        envelopes: Vec<Envelope>,
        correlation_id: Option<&str>,
    ) -> BatchReport {
        self.publish_batch_with_cancel(envelopes, correlation_id, &CancellationToken::new())
            .await
    }

    /// [`Self::publish_batch`] with cooperative cancellation.
    ///
    /// The token is checked before each event's transport hand-off; once it
    /// fires, the remaining events report [`DeliveryError::Cancelled`]
    /// without touching the transport. Events already handed off stand.
    pub async fn publish_batch_with_cancel(
        &self,
        envelopes: Vec<Envelope>,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        tracing::info!(count = envelopes.len(), "publishing batch");
        let mut outcomes = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let event_id = envelope.event_id;
            let result = self
                .publish_with_cancel(envelope, correlation_id, cancel)
                .await;
            outcomes.push(BatchOutcome { event_id, result });
        }
        let report = BatchReport { outcomes };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch finished"
        );
        report
    }

    /// Send an envelope point-to-point to a named queue, bypassing the
    /// exchange.
    ///
    /// # Errors
    ///
    /// See [`DeliveryError`]; the queue's own circuit applies, keyed
    /// `queue:<name>`.
    pub async fn send(&self, envelope: Envelope, queue: &str) -> Result<(), DeliveryError> {
        self.send_with_cancel(envelope, queue, &CancellationToken::new())
            .await
    }

    /// [`Self::send`] with cooperative cancellation, checked before the
    /// transport hand-off.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Cancelled`] when `cancel` fired first; otherwise as
    /// [`Self::send`].
    pub async fn send_with_cancel(
        &self,
        envelope: Envelope,
        queue: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        if cancel.is_cancelled() {
            tracing::info!(event_id = %envelope.event_id, queue, "send cancelled before hand-off");
            return Err(DeliveryError::Cancelled);
        }
        tracing::info!(
            kind = %envelope.kind(),
            event_id = %envelope.event_id,
            queue,
            "sending event point-to-point"
        );
        let result = self.inner.publisher.send_to_queue(&envelope, queue).await;
        log_outcome(&envelope, &result);
        result
    }

    /// Register a deferred publish; the envelope fires through the normal
    /// publish path (same breaker) at `scheduled_time_utc`.
    ///
    /// A time in the past fires immediately. The returned token cancels the
    /// schedule until it fires; a fired or cancelled token is spent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_publish(
        &self,
        envelope: Envelope,
        scheduled_time_utc: DateTime<Utc>,
    ) -> ScheduleToken {
        let token_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        lock(&self.inner.schedules).insert(token_id, cancel.clone());

        let delay = (scheduled_time_utc - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tracing::info!(
            %token_id,
            event_id = %envelope.event_id,
            %scheduled_time_utc,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduled publish registered"
        );

        let router = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(%token_id, "scheduled publish cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            // Removing the entry is the claim to fire: if a cancel got there
            // first, it already answered `true` and the publish must not run.
            if lock(&router.inner.schedules).remove(&token_id).is_none() {
                tracing::info!(%token_id, "scheduled publish cancelled");
                return;
            }
            let event_id = envelope.event_id;
            if let Err(err) = router.publish(envelope, None).await {
                tracing::error!(
                    %token_id,
                    %event_id,
                    error = %err,
                    "scheduled publish failed, event dropped"
                );
            }
        });

        ScheduleToken { token_id }
    }

    /// Cancel a pending scheduled publish. Returns whether a schedule was
    /// still pending under this token.
    pub fn cancel(&self, token: ScheduleToken) -> bool {
        match lock(&self.inner.schedules).remove(&token.token_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of schedules not yet fired or cancelled.
    #[must_use]
    pub fn pending_schedules(&self) -> usize {
        lock(&self.inner.schedules).len()
    }
}

fn log_outcome(envelope: &Envelope, result: &Result<(), DeliveryError>) {
    match result {
        Ok(()) => tracing::debug!(event_id = %envelope.event_id, "event delivered"),
        Err(err) => {
            tracing::error!(event_id = %envelope.event_id, error = %err, "delivery failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
