//! Recording notification consumer.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use herald_core::consumer::NotificationConsumer;
use herald_core::envelope::{Envelope, EventKind};
use herald_core::error::ConsumerError;

/// A [`NotificationConsumer`] that records every envelope it is handed and
/// answers from a script (defaulting to "side effect succeeded").
pub struct RecordingConsumer {
    kinds: Vec<EventKind>,
    handled: Mutex<Vec<Envelope>>,
    script: Mutex<VecDeque<Result<bool, ConsumerError>>>,
}

impl RecordingConsumer {
    /// Create a consumer interested in the given event kinds.
    #[must_use]
    pub fn new(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds,
            handled: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        }
    }

    /// Script the outcome of the next `handle` call. Unscripted calls
    /// return `Ok(true)`.
    pub fn respond_with(&self, outcome: Result<bool, ConsumerError>) {
        lock(&self.script).push_back(outcome);
    }

    /// Envelopes handled so far, in delivery order.
    #[must_use]
    pub fn handled(&self) -> Vec<Envelope> {
        lock(&self.handled).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl NotificationConsumer for RecordingConsumer {
    fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    fn handle(&self, envelope: &Envelope) -> BoxFuture<'_, Result<bool, ConsumerError>> {
        let envelope = envelope.clone();
        Box::pin(async move {
            lock(&self.handled).push(envelope);
            lock(&self.script).pop_front().unwrap_or(Ok(true))
        })
    }
}
