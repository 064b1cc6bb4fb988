//! Managed broker connection with a reconnection supervisor
//!
//! A [`Connection`] owns the live transport to one endpoint. A supervisor
//! task waits on the transport's own close/error signal and, when it fires,
//! runs the fixed retry loop from [`ReconnectConfig`]. Every successful
//! (re)connect bumps the generation and is published through a
//! `tokio::sync::watch` channel; workers compare the generation their channel
//! was derived from against it and rebind instead of reusing a stale channel.

use super::health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::state::{ConnectionEvent, ConnectionState, Link, ReconnectConfig};
use crate::connection_span;
use crate::error::{QueueError, QueueResult};
use crate::transport::{Broker, BrokerConnection};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Callback invoked once when the retry budget is exhausted
pub type FailureHook = Box<dyn Fn() + Send + Sync>;

const SUPERVISOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct ConnectionStats {
    connected_at: Option<Instant>,
    reconnect_count: u32,
}

/// One logical connection to a broker endpoint
pub struct Connection {
    id: Uuid,
    endpoint: String,
    broker: Arc<dyn Broker>,
    reconnect_config: ReconnectConfig,
    link_tx: watch::Sender<Link>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<ConnectionStats>,
    on_failed: Option<FailureHook>,
}

impl Connection {
    /// Dial `endpoint` and start supervising the resulting transport.
    ///
    /// Fails with [`QueueError::Connect`] if the initial dial fails; the retry
    /// loop only covers connections that were established at least once.
    pub async fn establish(
        endpoint: &str,
        broker: Arc<dyn Broker>,
        reconnect_config: ReconnectConfig,
        on_failed: Option<FailureHook>,
    ) -> QueueResult<Arc<Self>> {
        let (link_tx, _) = watch::channel(Link::connecting());
        let (shutdown_tx, _) = watch::channel(false);

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            broker,
            reconnect_config,
            link_tx,
            shutdown_tx,
            supervisor: Mutex::new(None),
            stats: Mutex::new(ConnectionStats::default()),
            on_failed,
        });

        info!(endpoint, "Connecting to broker");
        let transport = match connection.broker.connect(endpoint).await {
            Ok(transport) => transport,
            Err(e) => {
                connection.apply_event(ConnectionEvent::ConnectFailed(e.to_string()));
                return Err(QueueError::connect(endpoint, e));
            }
        };
        if !connection.publish_transport(transport.clone()) {
            let _ = transport.close().await;
            return Err(QueueError::Closed);
        }

        let shutdown_rx = connection.shutdown_tx.subscribe();
        let span = connection_span!(endpoint = %connection.endpoint, id = %connection.id);
        let handle = tokio::spawn(
            Self::supervise(Arc::downgrade(&connection), transport, shutdown_rx).instrument(span),
        );
        *lock(&connection.supervisor) = Some(handle);

        Ok(connection)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect_config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.link_tx.borrow().state.clone()
    }

    /// Current generation (number of successful connects so far)
    pub fn generation(&self) -> u64 {
        self.link_tx.borrow().generation
    }

    /// Observe state and generation changes
    pub fn subscribe(&self) -> watch::Receiver<Link> {
        self.link_tx.subscribe()
    }

    /// `true` once the connection failed for good or was closed
    pub fn is_terminated(&self) -> bool {
        self.link_tx.borrow().state.is_terminal()
    }

    /// `true` while the connection is `Ready` at exactly `generation`
    pub fn is_live_at(&self, generation: u64) -> bool {
        self.link_tx.borrow().is_live_at(generation)
    }

    /// Get health metrics for the connection
    pub fn health(&self) -> HealthMetrics {
        let (state, generation) = {
            let link = self.link_tx.borrow();
            (link.state.clone(), link.generation)
        };
        let stats = lock(&self.stats);
        HealthMonitor::calculate_health_metrics(
            &state,
            generation,
            stats.connected_at,
            stats.reconnect_count,
        )
    }

    /// Wait until the connection is `Ready` and return the live transport
    /// together with the generation it belongs to.
    ///
    /// Waits through `Disconnected`/`Reconnecting`; fails with
    /// [`QueueError::ConnectionLost`] once the retry budget is exhausted and
    /// with [`QueueError::Closed`] after an explicit close.
    pub(crate) async fn ready_transport(&self) -> QueueResult<(u64, Arc<dyn BrokerConnection>)> {
        let mut link_rx = self.link_tx.subscribe();
        loop {
            {
                let link = link_rx.borrow_and_update();
                match (&link.state, &link.transport) {
                    (ConnectionState::Ready, Some(transport)) => {
                        return Ok((link.generation, transport.clone()));
                    }
                    (state, _) if state.is_terminal() => {
                        return Err(self.terminal_error(state));
                    }
                    _ => {}
                }
            }
            if link_rx.changed().await.is_err() {
                return Err(QueueError::Closed);
            }
        }
    }

    /// Classify an operation that started on `generation` but can no longer
    /// trust it
    pub(crate) fn interruption(&self, generation: u64) -> QueueError {
        let state = self.state();
        if state.is_terminal() {
            self.terminal_error(&state)
        } else {
            QueueError::ChannelReset { generation }
        }
    }

    /// Wait up to `grace` for the connection to leave `Ready` at `generation`.
    /// Returns `true` if it did.
    pub(crate) async fn wait_past(&self, generation: u64, grace: Duration) -> bool {
        let mut link_rx = self.link_tx.subscribe();
        let moved = async {
            loop {
                if !link_rx.borrow_and_update().is_live_at(generation) {
                    return;
                }
                if link_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(grace, moved).await.is_ok()
    }

    /// Close the connection and stop the reconnection supervisor.
    ///
    /// Idempotent. Workers bound to this connection fail with
    /// [`QueueError::Closed`] on their next operation.
    pub async fn close(&self) -> QueueResult<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }

        let closed = HealthMonitor::determine_next_state(ConnectionEvent::Shutdown);
        let mut transport = None;
        let endpoint = &self.endpoint;
        self.link_tx.send_modify(|link| {
            HealthMonitor::log_state_transition(endpoint, &link.state, &closed);
            link.state = closed;
            transport = link.transport.take();
        });

        let handle = lock(&self.supervisor).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SUPERVISOR_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(endpoint = %self.endpoint, "Supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(endpoint = %self.endpoint, "Supervisor task ended with error: {}", e);
                }
                Err(_) => {
                    warn!(endpoint = %self.endpoint, "Supervisor didn't stop in time, aborting");
                    handle.abort();
                }
                _ => {}
            }
        }

        match transport {
            Some(transport) => transport.close().await.map_err(QueueError::from),
            None => Ok(()),
        }
    }

    fn terminal_error(&self, state: &ConnectionState) -> QueueError {
        match state {
            ConnectionState::Failed(_) => QueueError::ConnectionLost {
                endpoint: self.endpoint.clone(),
                attempts: self.reconnect_config.max_attempts,
            },
            _ => QueueError::Closed,
        }
    }

    /// Move to the state derived from `event`, keeping the generation.
    /// A closed connection stays closed.
    fn apply_event(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let endpoint = &self.endpoint;
        self.link_tx.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                return false;
            }
            HealthMonitor::log_state_transition(endpoint, &link.state, &next);
            link.state = next;
            link.transport = None;
            true
        });
    }

    /// Publish a freshly established transport as the next generation.
    /// Returns `false` if the connection was closed in the meantime.
    fn publish_transport(&self, transport: Arc<dyn BrokerConnection>) -> bool {
        let next = HealthMonitor::determine_next_state(ConnectionEvent::Established);
        let endpoint = &self.endpoint;
        let mut generation = None;
        self.link_tx.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                return false;
            }
            HealthMonitor::log_state_transition(endpoint, &link.state, &next);
            link.generation += 1;
            link.state = next;
            link.transport = Some(transport);
            generation = Some(link.generation);
            true
        });
        let Some(generation) = generation else {
            return false;
        };

        let mut stats = lock(&self.stats);
        stats.connected_at = Some(Instant::now());
        if generation > 1 {
            stats.reconnect_count += 1;
        }
        debug!(endpoint = %self.endpoint, generation, "Published transport");
        true
    }

    /// Supervisor loop: wait for the transport to drop, then recover.
    ///
    /// Holds only a weak reference so dropping the last `Arc<Connection>`
    /// ends supervision.
    async fn supervise(
        connection: Weak<Connection>,
        mut transport: Arc<dyn BrokerConnection>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = wait_for_signal(&mut shutdown_rx) => {
                    debug!("Shutdown signal received, stopping supervisor");
                    return;
                }
                reason = transport.closed() => reason,
            };

            let Some(connection) = connection.upgrade() else {
                return;
            };
            if *shutdown_rx.borrow() {
                return;
            }

            match connection.recover(reason.to_string(), shutdown_rx.clone()).await {
                Some(next) => transport = next,
                None => return,
            }
        }
    }

    /// Run the fixed retry loop. Returns the new transport on success and
    /// `None` once the budget is exhausted or shutdown was requested.
    async fn recover(
        &self,
        reason: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<Arc<dyn BrokerConnection>> {
        warn!(
            endpoint = %self.endpoint,
            generation = self.generation(),
            max_attempts = self.reconnect_config.max_attempts,
            give_up_after = ?self.reconnect_config.max_total_delay(),
            "{} disconnected: {}",
            self.endpoint,
            reason
        );
        self.apply_event(ConnectionEvent::TransportLost(reason));

        let mut attempts_made = 0u32;
        loop {
            let decision = HealthMonitor::should_attempt_reconnection(
                attempts_made,
                &self.reconnect_config,
                *shutdown_rx.borrow(),
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    if !delay.is_zero() && !interruptible_sleep(shutdown_rx.clone(), delay).await {
                        return None;
                    }
                    attempts_made = attempt;
                    self.apply_event(ConnectionEvent::ReconnectionStarted(attempt));

                    match self.broker.connect(&self.endpoint).await {
                        Ok(transport) => {
                            if *shutdown_rx.borrow() || !self.publish_transport(transport.clone()) {
                                let _ = transport.close().await;
                                return None;
                            }
                            return Some(transport);
                        }
                        Err(e) => {
                            warn!(
                                endpoint = %self.endpoint,
                                attempt,
                                max_attempts = self.reconnect_config.max_attempts,
                                "Reconnection attempt failed: {}",
                                e
                            );
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown signal received, stopping reconnection");
                    return None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    self.apply_event(ConnectionEvent::RetriesExhausted(attempts_made));
                    error!(
                        endpoint = %self.endpoint,
                        attempts = attempts_made,
                        "Giving up on broker connection"
                    );
                    if let Some(on_failed) = &self.on_failed {
                        on_failed();
                    }
                    return None;
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }

        // Dropping the transport here is best effort; call `close()` for a
        // clean broker-side shutdown.
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("link", &*self.link_tx.borrow())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve once `signal_rx` holds `true` or its sender is gone
pub(crate) async fn wait_for_signal(signal_rx: &mut watch::Receiver<bool>) {
    while !*signal_rx.borrow_and_update() {
        if signal_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring.
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_signal(&mut shutdown_rx) => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;

    const ENDPOINT: &str = "amqp://mock-broker";

    async fn wait_for(connection: &Connection, predicate: impl Fn(&Link) -> bool) {
        let mut link_rx = connection.subscribe();
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if predicate(&link_rx.borrow_and_update()) {
                    return;
                }
                link_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("connection never reached the expected state");
    }

    #[tokio::test]
    async fn test_establish_starts_ready_at_generation_one() {
        let broker = MockBroker::new();
        let connection = Connection::establish(ENDPOINT, Arc::new(broker.clone()), ReconnectConfig::default(), None)
            .await
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(connection.generation(), 1);
        assert!(connection.health().is_healthy);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_establish_surfaces_connect_error() {
        let broker = MockBroker::new();
        broker.refuse_connections(1);

        let result =
            Connection::establish(ENDPOINT, Arc::new(broker), ReconnectConfig::default(), None).await;
        assert!(matches!(result, Err(QueueError::Connect { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_bumps_generation_and_stops_on_first_success() {
        let broker = MockBroker::new();
        let connection = Connection::establish(ENDPOINT, Arc::new(broker.clone()), ReconnectConfig::default(), None)
            .await
            .unwrap();

        broker.refuse_connections(2);
        broker.sever_connections("simulated outage");

        wait_for(&connection, |link| link.is_live_at(2)).await;
        // initial + two refused + one successful
        assert_eq!(broker.connect_attempts(), 4);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_attempts(), 4, "retry loop must stop after success");
        assert_eq!(connection.health().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_fails_and_runs_hook() {
        let broker = MockBroker::new();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_flag = fired.clone();
        let connection = Connection::establish(
            ENDPOINT,
            Arc::new(broker.clone()),
            ReconnectConfig::default(),
            Some(Box::new(move || {
                hook_flag.store(true, std::sync::atomic::Ordering::SeqCst)
            })),
        )
        .await
        .unwrap();

        broker.refuse_all(true);
        let started = tokio::time::Instant::now();
        broker.sever_connections("broker gone");

        wait_for(&connection, |link| matches!(link.state(), ConnectionState::Failed(_))).await;
        assert_eq!(broker.connect_attempts(), 1 + 7);
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(
            connection.ready_transport().await,
            Err(QueueError::ConnectionLost { attempts: 7, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_reconnection() {
        let broker = MockBroker::new();
        let connection = Connection::establish(ENDPOINT, Arc::new(broker.clone()), ReconnectConfig::default(), None)
            .await
            .unwrap();

        broker.refuse_all(true);
        broker.sever_connections("broker gone");
        wait_for(&connection, |link| matches!(link.state(), ConnectionState::Reconnecting(_))).await;

        connection.close().await.unwrap();
        let attempts = broker.connect_attempts();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(broker.connect_attempts(), attempts);
        assert!(matches!(connection.ready_transport().await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MockBroker::new();
        let connection = Connection::establish(ENDPOINT, Arc::new(broker.clone()), ReconnectConfig::default(), None)
            .await
            .unwrap();

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_interruption_classification() {
        let broker = MockBroker::new();
        let connection = Connection::establish(ENDPOINT, Arc::new(broker), ReconnectConfig::default(), None)
            .await
            .unwrap();

        assert!(matches!(
            connection.interruption(1),
            QueueError::ChannelReset { generation: 1 }
        ));

        connection.close().await.unwrap();
        assert!(matches!(connection.interruption(1), QueueError::Closed));
    }
}
