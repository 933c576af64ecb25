//! Broker connection lifecycle with backoff reconnect.
//!
//! One [`ConnectionManager`] owns at most one broker connection at a time and
//! hands out short-lived channels. Connection establishment runs through the
//! retry executor: transient failures (broker unreachable, connection
//! refused) are retried with exponential backoff; anything else, such as bad
//! credentials, fails immediately.
//!
//! Reconnection is attempt-driven. A dead connection is noticed the next time
//! a caller asks for a channel, not by a background watchdog; connection
//! events from the broker are logged and fanned out to observers but never
//! trigger reconnection themselves.
//!
//! # Locking
//!
//! Two locks with distinct jobs: the state lock guards the connection slot
//! and status and is only ever held briefly, while the connect gate
//! serializes whole connect cycles (backoff sleeps included). Readers calling
//! [`ConnectionManager::status`] or [`ConnectionManager::is_connected`]
//! during a retry cycle see [`ConnectionState::Connecting`] immediately
//! instead of queueing behind the backoff budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use herald_core::error::DeliveryError;
use herald_core::transport::{
    ConnectionEvent, ConnectionEventCallback, Transport, TransportChannel, TransportConnection,
};
use herald_runtime::retry::{Attempt, RetryError, RetryPolicy, run_with_backoff};

use crate::config::BrokerConfig;

/// Where the manager currently stands with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable connection; nothing in progress.
    Disconnected,
    /// A connect attempt (possibly with retries) is running.
    Connecting,
    /// An open connection is available.
    Connected,
}

/// Point-in-time view of the connection, for logging and health endpoints.
#[derive(Clone, Debug)]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Attempts made by the most recent failed connect cycle.
    pub retry_count: usize,
    /// The last connection error observed, if any.
    pub last_error: Option<String>,
    /// When the current or most recent connection was established.
    pub last_connected_at: Option<DateTime<Utc>>,
}

struct Inner {
    connection: Option<Arc<dyn TransportConnection>>,
    status: ConnectionStatus,
}

/// Owns the broker connection and reconnects on demand.
///
/// Constructed explicitly with a [`Transport`], so tests inject an in-memory
/// fake and production wires in the AMQP adapter.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    state: tokio::sync::Mutex<Inner>,
    connect_gate: tokio::sync::Mutex<()>,
    cycles_completed: AtomicU64,
    observers: Arc<Mutex<Vec<ConnectionEventCallback>>>,
}

impl ConnectionManager {
    /// Create a disconnected manager. No connection is attempted until the
    /// first channel is requested (or [`Self::try_connect`] is called).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: &BrokerConfig) -> Self {
        Self {
            transport,
            policy: config.retry_policy(),
            state: tokio::sync::Mutex::new(Inner {
                connection: None,
                status: ConnectionStatus {
                    state: ConnectionState::Disconnected,
                    retry_count: 0,
                    last_error: None,
                    last_connected_at: None,
                },
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            cycles_completed: AtomicU64::new(0),
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ensure a connection exists, retrying with backoff on transient
    /// failures. Returns whether a usable connection is now available.
    ///
    /// Connect cycles are serialized on the gate, so a broker outage costs
    /// one retry cycle, not one per caller; callers that only read status do
    /// not wait on the cycle at all.
    pub async fn try_connect(&self) -> bool {
        if self.current_connection().await.is_some() {
            return true;
        }
        self.establish().await
    }

    /// Get a fresh channel, connecting or reconnecting as needed.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NoConnection`] when no connection could be
    /// established within the retry budget, [`DeliveryError::Transport`] when
    /// connected but channel creation still failed after one reconnect.
    pub async fn create_channel(&self) -> Result<Box<dyn TransportChannel>, DeliveryError> {
        let connection = match self.current_connection().await {
            Some(connection) => connection,
            None => {
                if !self.establish().await {
                    return Err(self.no_connection().await);
                }
                match self.current_connection().await {
                    Some(connection) => connection,
                    None => return Err(self.no_connection().await),
                }
            }
        };

        match connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                // The connection died between the health check and the
                // channel request. Replace it once and try again.
                tracing::warn!(error = %err, "channel creation failed, reconnecting");
                self.discard(&connection).await;
                if !self.establish().await {
                    return Err(self.no_connection().await);
                }
                match self.current_connection().await {
                    Some(replacement) => replacement
                        .create_channel()
                        .await
                        .map_err(DeliveryError::from),
                    None => Err(self.no_connection().await),
                }
            }
        }
    }

    /// Whether an open connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.current_connection().await.is_some()
    }

    /// Current connection status. Never blocks on a running connect cycle.
    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status.clone()
    }

    /// Register an observer for connection-level events.
    ///
    /// Observers registered before the first connect are carried across
    /// reconnects; events are delivered on the broker client's callback
    /// thread, so observers must not block.
    pub fn subscribe_events(&self, callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static) {
        lock(&self.observers).push(Arc::new(callback));
    }

    /// The open connection, if the held one is still usable.
    async fn current_connection(&self) -> Option<Arc<dyn TransportConnection>> {
        let state = self.state.lock().await;
        state
            .connection
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    /// Drop a connection known to be dead, unless another task already
    /// replaced it.
    async fn discard(&self, stale: &Arc<dyn TransportConnection>) {
        let mut state = self.state.lock().await;
        let is_current = state
            .connection
            .as_ref()
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(stale)));
        if is_current {
            state.connection = None;
            state.status.state = ConnectionState::Disconnected;
        }
    }

    async fn no_connection(&self) -> DeliveryError {
        let status = self.status().await;
        DeliveryError::NoConnection {
            attempts: status.retry_count,
            reason: status
                .last_error
                .unwrap_or_else(|| "no connection".to_string()),
        }
    }

    /// Run one full connect cycle. The gate serializes cycles; the state
    /// lock is taken only to flip status and install the outcome.
    ///
    /// Callers that waited behind a cycle adopt its outcome instead of
    /// running their own, so an outage costs one retry cycle regardless of
    /// how many callers piled up behind it.
    async fn establish(&self) -> bool {
        let observed = self.cycles_completed.load(Ordering::Acquire);
        let _cycle = self.connect_gate.lock().await;
        if self.cycles_completed.load(Ordering::Acquire) != observed {
            return self.current_connection().await.is_some();
        }
        if self.current_connection().await.is_some() {
            return true;
        }
        self.state.lock().await.status.state = ConnectionState::Connecting;

        let result = run_with_backoff(&self.policy, |attempt| {
            let transport = Arc::clone(&self.transport);
            async move {
                tracing::debug!(attempt, "connecting to broker");
                match transport.connect().await {
                    Ok(connection) => Attempt::Ok(connection),
                    Err(err) if err.is_transient_connect() => Attempt::Retryable(err),
                    Err(err) => Attempt::Fatal(err),
                }
            }
        })
        .await;

        let mut state = self.state.lock().await;
        self.cycles_completed.fetch_add(1, Ordering::Release);
        match result {
            Ok(connection) => {
                let observers = Arc::clone(&self.observers);
                connection.on_event(Arc::new(move |event| {
                    log_connection_event(event);
                    for callback in lock(&observers).iter() {
                        callback(event);
                    }
                }));
                state.connection = Some(connection);
                state.status = ConnectionStatus {
                    state: ConnectionState::Connected,
                    retry_count: 0,
                    last_error: None,
                    last_connected_at: Some(Utc::now()),
                };
                tracing::info!("broker connection established");
                true
            }
            Err(err) => {
                let attempts = match &err {
                    RetryError::Exhausted { attempts, .. } => *attempts,
                    RetryError::Fatal { attempt, .. } => *attempt,
                };
                let reason = err.into_inner().to_string();
                tracing::error!(attempts, error = %reason, "broker connection failed");
                state.connection = None;
                state.status.state = ConnectionState::Disconnected;
                state.status.retry_count = attempts;
                state.status.last_error = Some(reason);
                false
            }
        }
    }
}

fn log_connection_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Shutdown { reason } => {
            tracing::warn!(reason, "broker connection shut down");
        }
        ConnectionEvent::Blocked { reason } => {
            tracing::warn!(reason, "broker connection blocked");
        }
        ConnectionEvent::Unblocked => tracing::info!("broker connection unblocked"),
        ConnectionEvent::CallbackError { detail } => {
            tracing::error!(detail, "broker callback error");
        }
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
    use herald_core::transport::TransportError;
    use herald_testing::FakeTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn config(retry_count: usize) -> BrokerConfig {
        BrokerConfig::builder()
            .retry_count(retry_count)
            .retry_base_delay(Duration::from_millis(10))
            .build()
    }

    fn manager(transport: &Arc<FakeTransport>, retry_count: usize) -> ConnectionManager {
        ConnectionManager::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            &config(retry_count),
        )
    }

    #[tokio::test]
    async fn retries_transient_connect_failures_with_backoff() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next_connects(2);
        let manager = manager(&transport, 5);
        let started = Instant::now();

        assert!(manager.try_connect().await);
        assert_eq!(transport.connect_attempts(), 3);
        // Two backoff delays: 10ms + 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(manager.is_connected().await);
        assert_eq!(manager.status().await.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn gives_up_after_the_retry_budget() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next_connects(3);
        let manager = manager(&transport, 3);

        assert!(!manager.try_connect().await);
        assert_eq!(transport.connect_attempts(), 3);

        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.retry_count, 3);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn channel_request_surfaces_no_connection() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next_connects(2);
        let manager = manager(&transport, 2);

        let result = manager.create_channel().await;
        assert!(matches!(
            result,
            Err(DeliveryError::NoConnection { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_connect_calls_share_one_connection() {
        let transport = Arc::new(FakeTransport::new());
        let manager = manager(&transport, 5);

        let (first, second) = tokio::join!(manager.try_connect(), manager.try_connect());
        assert!(first);
        assert!(second);
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn callers_waiting_on_a_failed_cycle_adopt_its_outcome() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next_connects(10);
        let manager = manager(&transport, 3);

        let (first, second) = tokio::join!(manager.try_connect(), manager.try_connect());
        assert!(!first);
        assert!(!second);
        // One retry cycle of three attempts, not one cycle per caller.
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn status_reads_do_not_wait_for_a_running_retry_cycle() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next_connects(5);
        // Budget of 5 attempts with 10ms base: backoffs 10+20+40+80ms.
        let manager = Arc::new(manager(&transport, 5));

        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.try_connect().await }
        });

        // Mid-cycle: status answers immediately and shows the cycle.
        tokio::time::sleep(Duration::from_millis(25)).await;
        let asked = Instant::now();
        let status = manager.status().await;
        assert!(asked.elapsed() < Duration::from_millis(50));
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(!manager.is_connected().await);

        assert!(matches!(connecting.await, Ok(false)));
        assert_eq!(manager.status().await.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn non_transient_connect_errors_are_not_retried() {
        let transport = Arc::new(FakeTransport::new());
        transport.script_connect_failure(TransportError::Channel("bad credentials".to_string()));
        let manager = manager(&transport, 5);

        assert!(!manager.try_connect().await);
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(manager.status().await.retry_count, 1);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced_on_next_channel_request() {
        let transport = Arc::new(FakeTransport::new());
        let manager = manager(&transport, 5);

        assert!(manager.try_connect().await);
        transport.kill_connection();

        let channel = manager.create_channel().await;
        assert!(channel.is_ok());
        // First connect plus the replacement.
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn observers_receive_connection_events() {
        let transport = Arc::new(FakeTransport::new());
        let manager = manager(&transport, 5);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        manager.subscribe_events(move |event| {
            if matches!(event, ConnectionEvent::Shutdown { .. }) {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(manager.try_connect().await);
        transport.emit(&ConnectionEvent::Shutdown {
            reason: "broker going away".to_string(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
