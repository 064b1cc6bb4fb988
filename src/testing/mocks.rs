//! In-memory broker for tests
//!
//! [`MockBroker`] implements the transport traits without a network: queues
//! live in a shared map, unacknowledged messages are tracked per channel and
//! requeued at the front when their channel closes, and connection failures
//! can be injected on demand.

use crate::connection::managed::lock;
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, DeliveryStream, RawMessage,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Bytes>>,
    connect_attempts: usize,
    refuse_remaining: usize,
    refuse_all: bool,
    connect_delay: Duration,
    failing_close: HashSet<String>,
    failing_sends: HashSet<String>,
    channels_opened: usize,
    connections: Vec<Weak<ConnectionInner>>,
}

/// Mock broker shared by every connection it hands out
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connect calls
    pub fn refuse_connections(&self, count: usize) {
        lock(&self.state).refuse_remaining = count;
    }

    /// Refuse every connect call while `refuse` is set
    pub fn refuse_all(&self, refuse: bool) {
        lock(&self.state).refuse_all = refuse;
    }

    /// Delay every connect call, so concurrent callers overlap
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Make closing connections to `endpoint` fail
    pub fn fail_close_for(&self, endpoint: &str) {
        lock(&self.state).failing_close.insert(endpoint.to_string());
    }

    /// Fail the next publish to `queue` with a channel error. The channel
    /// it was sent on is closed; its connection stays up.
    pub fn fail_next_send(&self, queue: &str) {
        lock(&self.state).failing_sends.insert(queue.to_string());
    }

    /// End every consumer on `queue` as a broker-side cancel would, leaving
    /// channels and connections open
    pub fn cancel_consumers(&self, queue: &str) {
        for connection in self.live() {
            for channel in lock(&connection.channels).iter() {
                lock(&channel.cancelled).insert(queue.to_string());
            }
        }
        self.notify.notify_waiters();
    }

    /// Drop every live connection as if the network went away
    pub fn sever_connections(&self, reason: &str) {
        for connection in self.live() {
            connection.shut(BrokerError::Closed(reason.to_string()));
        }
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    /// Channels created over the broker's lifetime
    pub fn channels_opened(&self) -> usize {
        lock(&self.state).channels_opened
    }

    pub fn live_connections(&self) -> usize {
        self.live().len()
    }

    /// Messages waiting in `queue` (unacknowledged deliveries not included)
    pub fn queue_len(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Delivered but not yet acknowledged messages across live channels
    pub fn unacked_len(&self) -> usize {
        self.live()
            .iter()
            .flat_map(|connection| lock(&connection.channels).clone())
            .filter(|channel| channel.open.load(Ordering::SeqCst))
            .map(|channel| lock(&channel.unacked).len())
            .sum()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Enqueue raw bytes, bypassing task encoding
    pub fn publish_raw(&self, queue: &str, payload: impl Into<Bytes>) {
        self.push_back(queue, payload.into());
    }

    fn live(&self) -> Vec<Arc<ConnectionInner>> {
        let mut state = lock(&self.state);
        state.connections.retain(|weak| weak.strong_count() > 0);
        state
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|connection| connection.is_alive())
            .collect()
    }

    fn push_back(&self, queue: &str, payload: Bytes) {
        lock(&self.state)
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    fn pop_front(&self, queue: &str) -> Option<Bytes> {
        lock(&self.state).queues.get_mut(queue)?.pop_front()
    }

    fn requeue(&self, messages: Vec<(String, Bytes)>) {
        if messages.is_empty() {
            return;
        }
        {
            let mut state = lock(&self.state);
            for (queue, payload) in messages.into_iter().rev() {
                state.queues.entry(queue).or_default().push_front(payload);
            }
        }
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockBroker")
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("connect_attempts", &state.connect_attempts)
            .finish()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let delay = {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let refused = if state.refuse_all {
            true
        } else if state.refuse_remaining > 0 {
            state.refuse_remaining -= 1;
            true
        } else {
            false
        };
        if refused {
            return Err(BrokerError::ConnectionFailed(format!(
                "connection refused: {endpoint}"
            )));
        }

        let (dead_tx, _) = watch::channel(None);
        let inner = Arc::new(ConnectionInner {
            endpoint: endpoint.to_string(),
            broker: self.clone(),
            dead_tx,
            channels: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::downgrade(&inner));
        Ok(Arc::new(MockConnection { inner }))
    }
}

struct ConnectionInner {
    endpoint: String,
    broker: MockBroker,
    dead_tx: watch::Sender<Option<BrokerError>>,
    channels: Mutex<Vec<Arc<ChannelInner>>>,
}

impl ConnectionInner {
    fn is_alive(&self) -> bool {
        self.dead_tx.borrow().is_none()
    }

    /// Mark the connection dead and close its channels. Returns `false` if it
    /// was already dead.
    fn shut(&self, reason: BrokerError) -> bool {
        let shut = self.dead_tx.send_if_modified(|dead| {
            if dead.is_some() {
                return false;
            }
            *dead = Some(reason);
            true
        });
        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels {
            channel.shut();
        }
        self.broker.notify.notify_waiters();
        shut
    }
}

struct MockConnection {
    inner: Arc<ConnectionInner>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.inner.is_alive() {
            return Err(BrokerError::Closed("connection is closed".to_string()));
        }
        let channel = Arc::new(ChannelInner {
            broker: self.inner.broker.clone(),
            connection: Arc::downgrade(&self.inner),
            open: AtomicBool::new(true),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(BTreeMap::new()),
            cancelled: Mutex::new(HashSet::new()),
        });
        lock(&self.inner.channels).push(channel.clone());
        lock(&self.inner.broker.state).channels_opened += 1;
        Ok(Arc::new(MockChannel { inner: channel }))
    }

    async fn closed(&self) -> BrokerError {
        let mut dead_rx = self.inner.dead_tx.subscribe();
        loop {
            if let Some(reason) = dead_rx.borrow_and_update().clone() {
                return reason;
            }
            if dead_rx.changed().await.is_err() {
                return BrokerError::Closed("connection dropped".to_string());
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .shut(BrokerError::Closed("closed by client".to_string()));
        let failing = lock(&self.inner.broker.state)
            .failing_close
            .contains(&self.inner.endpoint);
        if failing {
            return Err(BrokerError::Closed(format!(
                "injected close failure for {}",
                self.inner.endpoint
            )));
        }
        Ok(())
    }
}

struct ChannelInner {
    broker: MockBroker,
    connection: Weak<ConnectionInner>,
    open: AtomicBool,
    next_tag: AtomicU64,
    unacked: Mutex<BTreeMap<u64, (String, Bytes)>>,
    cancelled: Mutex<HashSet<String>>,
}

impl ChannelInner {
    fn usable(&self) -> Result<(), BrokerError> {
        let connected = self
            .connection
            .upgrade()
            .is_some_and(|connection| connection.is_alive());
        if !connected {
            return Err(BrokerError::Closed("connection is closed".to_string()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel is closed".to_string()));
        }
        Ok(())
    }

    fn take(&self, queue: &str, no_ack: bool) -> Option<RawMessage> {
        let payload = self.broker.pop_front(queue)?;
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if !no_ack {
            lock(&self.unacked).insert(delivery_tag, (queue.to_string(), payload.clone()));
        }
        Some(RawMessage {
            delivery_tag,
            payload,
        })
    }

    /// Close the channel and hand unacknowledged messages back to their queues
    fn shut(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let unacked = std::mem::take(&mut *lock(&self.unacked));
        self.broker.requeue(unacked.into_values().collect());
        self.broker.notify.notify_waiters();
    }
}

struct MockChannel {
    inner: Arc<ChannelInner>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner.usable()?;
        lock(&self.inner.broker.state)
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.inner.usable()?;
        let failing = lock(&self.inner.broker.state).failing_sends.remove(queue);
        if failing {
            self.inner.shut();
            return Err(BrokerError::Channel(format!(
                "injected publish failure on '{queue}'"
            )));
        }
        self.inner.broker.push_back(queue, payload);
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawMessage>, BrokerError> {
        self.inner.usable()?;
        Ok(self.inner.take(queue, no_ack))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner.usable()?;
        match lock(&self.inner.unacked).remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(BrokerError::Channel(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, BrokerError> {
        self.inner.usable()?;
        lock(&self.inner.cancelled).remove(queue);
        let seed = (self.inner.clone(), queue.to_string());
        let deliveries = stream::unfold(seed, move |(channel, queue)| async move {
            loop {
                let notify = channel.broker.notify.clone();
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if channel.usable().is_err() || lock(&channel.cancelled).contains(&queue) {
                    return None;
                }
                if let Some(message) = channel.take(&queue, no_ack) {
                    return Some((Ok::<_, BrokerError>(message), (channel, queue)));
                }
                notified.await;
            }
        });
        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.usable()?;
        self.inner.shut();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const ENDPOINT: &str = "amqp://mock";

    #[tokio::test]
    async fn test_refused_then_accepted() {
        let broker = MockBroker::new();
        broker.refuse_connections(1);

        assert!(broker.connect(ENDPOINT).await.is_err());
        assert!(broker.connect(ENDPOINT).await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_unacked_message_requeued_on_channel_close() {
        let broker = MockBroker::new();
        let connection = broker.connect(ENDPOINT).await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        broker.publish_raw("jobs", "first");
        broker.publish_raw("jobs", "second");
        let message = channel.get("jobs", false).await.unwrap().unwrap();
        assert_eq!(message.payload, Bytes::from("first"));
        assert_eq!(broker.unacked_len(), 1);

        channel.close().await.unwrap();
        assert_eq!(broker.queue_len("jobs"), 2);

        let channel = connection.create_channel().await.unwrap();
        let message = channel.get("jobs", true).await.unwrap().unwrap();
        assert_eq!(message.payload, Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_sever_resolves_closed_and_ends_consumers() {
        let broker = MockBroker::new();
        let connection = broker.connect(ENDPOINT).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let mut deliveries = channel.consume("jobs", true).await.unwrap();

        broker.publish_raw("jobs", "one");
        assert_eq!(
            deliveries.next().await.unwrap().unwrap().payload,
            Bytes::from("one")
        );

        broker.sever_connections("network down");
        assert_eq!(
            connection.closed().await,
            BrokerError::Closed("network down".to_string())
        );
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.live_connections(), 0);
        assert!(channel.get("jobs", true).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_close_still_closes() {
        let broker = MockBroker::new();
        broker.fail_close_for(ENDPOINT);
        let connection = broker.connect(ENDPOINT).await.unwrap();

        assert!(connection.close().await.is_err());
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_closes_channel_but_not_connection() {
        let broker = MockBroker::new();
        let connection = broker.connect(ENDPOINT).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        broker.fail_next_send("jobs");

        assert!(matches!(
            channel.send_to_queue("jobs", Bytes::from("a")).await,
            Err(BrokerError::Channel(_))
        ));
        assert!(channel.send_to_queue("jobs", Bytes::from("b")).await.is_err());
        assert_eq!(broker.live_connections(), 1);

        let fresh = connection.create_channel().await.unwrap();
        fresh.send_to_queue("jobs", Bytes::from("c")).await.unwrap();
        assert_eq!(broker.queue_len("jobs"), 1);
        assert_eq!(broker.channels_opened(), 2);
    }

    #[tokio::test]
    async fn test_cancel_ends_consumer_only() {
        let broker = MockBroker::new();
        let connection = broker.connect(ENDPOINT).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let mut deliveries = channel.consume("jobs", true).await.unwrap();

        broker.cancel_consumers("jobs");

        assert!(deliveries.next().await.is_none());
        assert!(channel.get("jobs", true).await.is_ok());
        assert_eq!(broker.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_ack_of_unknown_tag_fails() {
        let broker = MockBroker::new();
        let connection = broker.connect(ENDPOINT).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        assert!(matches!(
            channel.ack(99).await,
            Err(BrokerError::Channel(_))
        ));
    }
}
