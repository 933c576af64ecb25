//! In-memory fake broker transport.
//!
//! `FakeTransport` implements the `herald-core` transport traits without any
//! network I/O. Tests script failures ("the broker is down for the next two
//! connects", "the next publish fails") and then assert on what was captured:
//! connect attempts, declared topology, published messages with their full
//! property set, and ack/requeue decisions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use herald_core::transport::{
    Acker, ConnectionEvent, ConnectionEventCallback, Delivery, DeliveryStream, ExchangeSpec,
    MessageProperties, Transport, TransportChannel, TransportConnection, TransportError,
};
use tokio::sync::mpsc;

/// A message captured by the fake channel.
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    /// Exchange the message was published to ("" for the default exchange).
    pub exchange: String,
    /// Routing key used.
    pub routing_key: String,
    /// Full wire properties, headers included.
    pub properties: MessageProperties,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

/// How a delivery was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Acknowledged; the broker forgets the message.
    Acked,
    /// Negatively acknowledged with requeue; the broker redelivers.
    Requeued,
}

type DeliveryResult = Result<Delivery, TransportError>;

#[derive(Default)]
struct Shared {
    connect_failures: Mutex<VecDeque<TransportError>>,
    connect_attempts: AtomicUsize,
    connection_open: AtomicBool,
    publish_failures: Mutex<VecDeque<TransportError>>,
    publish_attempts: AtomicUsize,
    published: Mutex<Vec<PublishedMessage>>,
    declared_exchanges: Mutex<Vec<ExchangeSpec>>,
    declared_queues: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    callbacks: Mutex<Vec<ConnectionEventCallback>>,
    acks: Mutex<Vec<(String, AckOutcome)>>,
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryResult>>>,
}

/// Scriptable in-memory broker.
pub struct FakeTransport {
    shared: Arc<Shared>,
    delivery_tx: Mutex<Option<mpsc::UnboundedSender<DeliveryResult>>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Create a fake broker that accepts everything until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        *lock(&shared.delivery_rx) = Some(rx);
        Self {
            shared,
            delivery_tx: Mutex::new(Some(tx)),
        }
    }

    /// Make the next `n` connect attempts fail as broker-unreachable.
    pub fn fail_next_connects(&self, n: usize) {
        let mut failures = lock(&self.shared.connect_failures);
        for i in 0..n {
            failures.push_back(TransportError::Unreachable(format!(
                "scripted connect failure {i}"
            )));
        }
    }

    /// Make the next connect attempt fail with a specific error.
    pub fn script_connect_failure(&self, error: TransportError) {
        lock(&self.shared.connect_failures).push_back(error);
    }

    /// Make the next `n` publishes fail at the broker.
    pub fn fail_next_publishes(&self, n: usize) {
        let mut failures = lock(&self.shared.publish_failures);
        for i in 0..n {
            failures.push_back(TransportError::Publish(format!(
                "scripted publish failure {i}"
            )));
        }
    }

    /// Mark the current connection dead, as after a broker-side close.
    pub fn kill_connection(&self) {
        self.shared.connection_open.store(false, Ordering::SeqCst);
    }

    /// Fire a connection-level event at every registered observer.
    pub fn emit(&self, event: &ConnectionEvent) {
        for callback in lock(&self.shared.callbacks).iter() {
            callback(event);
        }
    }

    /// Queue an inbound delivery for the next `consume` stream.
    ///
    /// `label` identifies the delivery in [`Self::acks`].
    pub fn inject_delivery(&self, body: Vec<u8>, label: &str) {
        let delivery = Delivery {
            body,
            acker: Box::new(FakeAcker {
                label: label.to_string(),
                shared: Arc::clone(&self.shared),
            }),
        };
        if let Some(tx) = lock(&self.delivery_tx).as_ref() {
            let _ = tx.send(Ok(delivery));
        }
    }

    /// Close the inbound delivery stream, ending any consumer loop.
    pub fn finish_deliveries(&self) {
        lock(&self.delivery_tx).take();
    }

    /// Connect attempts made so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Publish attempts made so far, successful or not.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.shared.publish_attempts.load(Ordering::SeqCst)
    }

    /// Messages accepted by the fake broker, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared.published).clone()
    }

    /// Exchanges declared so far.
    #[must_use]
    pub fn declared_exchanges(&self) -> Vec<ExchangeSpec> {
        lock(&self.shared.declared_exchanges).clone()
    }

    /// Queues declared so far.
    #[must_use]
    pub fn declared_queues(&self) -> Vec<String> {
        lock(&self.shared.declared_queues).clone()
    }

    /// Queue bindings declared so far, as (queue, exchange, routing key).
    #[must_use]
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        lock(&self.shared.bindings).clone()
    }

    /// Channels opened so far.
    #[must_use]
    pub fn channels_opened(&self) -> usize {
        self.shared.channels_opened.load(Ordering::SeqCst)
    }

    /// Channels released so far.
    #[must_use]
    pub fn channels_closed(&self) -> usize {
        self.shared.channels_closed.load(Ordering::SeqCst)
    }

    /// Settlement decisions recorded so far, as (label, outcome).
    #[must_use]
    pub fn acks(&self) -> Vec<(String, AckOutcome)> {
        lock(&self.shared.acks).clone()
    }
}

/// Poisoned mutexes only happen after a panicking test thread; propagating
/// the inner value keeps the fakes usable in that situation.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Transport for FakeTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn TransportConnection>, TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = lock(&shared.connect_failures).pop_front() {
                return Err(error);
            }
            shared.connection_open.store(true, Ordering::SeqCst);
            Ok(Arc::new(FakeConnection { shared }) as Arc<dyn TransportConnection>)
        })
    }
}

struct FakeConnection {
    shared: Arc<Shared>,
}

impl TransportConnection for FakeConnection {
    fn create_channel(&self) -> BoxFuture<'_, Result<Box<dyn TransportChannel>, TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if !shared.connection_open.load(Ordering::SeqCst) {
                return Err(TransportError::Channel("connection closed".to_string()));
            }
            shared.channels_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeChannel { shared }) as Box<dyn TransportChannel>)
        })
    }

    fn is_open(&self) -> bool {
        self.shared.connection_open.load(Ordering::SeqCst)
    }

    fn on_event(&self, callback: ConnectionEventCallback) {
        lock(&self.shared.callbacks).push(callback);
    }
}

struct FakeChannel {
    shared: Arc<Shared>,
}

impl TransportChannel for FakeChannel {
    fn declare_exchange(&self, spec: &ExchangeSpec) -> BoxFuture<'_, Result<(), TransportError>> {
        let spec = spec.clone();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            lock(&shared.declared_exchanges).push(spec);
            Ok(())
        })
    }

    fn declare_queue(&self, name: &str) -> BoxFuture<'_, Result<(), TransportError>> {
        let name = name.to_string();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            lock(&shared.declared_queues).push(name);
            Ok(())
        })
    }

    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        );
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            lock(&shared.bindings).push(binding);
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
        };
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.publish_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = lock(&shared.publish_failures).pop_front() {
                return Err(error);
            }
            lock(&shared.published).push(message);
            Ok(())
        })
    }

    fn consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
    ) -> BoxFuture<'_, Result<DeliveryStream, TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let Some(rx) = lock(&shared.delivery_rx).take() else {
                return Err(TransportError::Consume(
                    "consume already started".to_string(),
                ));
            };
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.channels_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct FakeAcker {
    label: String,
    shared: Arc<Shared>,
}

impl Acker for FakeAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            lock(&self.shared.acks).push((self.label.clone(), AckOutcome::Acked));
            Ok(())
        })
    }

    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            lock(&self.shared.acks).push((self.label.clone(), AckOutcome::Requeued));
            Ok(())
        })
    }
}
