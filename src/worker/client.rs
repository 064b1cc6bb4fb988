//! Queue worker bound to a managed connection
//!
//! A [`Worker`] keeps one channel derived from its [`Connection`] and records
//! the generation it was derived from. Before every broker call the worker
//! checks that generation is still live; after a reconnect the stale channel
//! is replaced in place, so callers keep using the same `Worker` through a
//! network blip. An operation that started on generation N never continues
//! on N+1: it fails with [`QueueError::ChannelReset`] instead.

use super::codec;
use super::delivery::{Delivery, PendingAck};
use crate::connection::managed::wait_for_signal;
use crate::connection::Connection;
use crate::error::{HandlerError, QueueError, QueueResult};
use crate::queue_span;
use crate::transport::{BrokerChannel, BrokerError, RawMessage};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// How long a consumer whose delivery feed ended waits for the connection to
/// report the disconnect before treating the end as a broker-side cancel
const FEED_END_GRACE: Duration = Duration::from_secs(1);

/// Options for [`Worker::get`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Let the broker consider the message consumed on delivery
    pub no_ack: bool,
}

impl GetOptions {
    pub fn no_ack() -> Self {
        Self { no_ack: true }
    }
}

/// Options for [`Worker::consume`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Skip acknowledgements; messages count as consumed on delivery
    pub no_ack: bool,
}

impl ConsumeOptions {
    pub fn no_ack() -> Self {
        Self { no_ack: true }
    }
}

#[derive(Clone)]
struct BoundChannel {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

/// Public queue handle: put, get, consume and close
pub struct Worker {
    id: Uuid,
    connection: Arc<Connection>,
    slot: Mutex<Option<BoundChannel>>,
    closed_tx: watch::Sender<bool>,
}

/// Name used by callers that think of the worker as a queue client
pub type QueueClient = Worker;

impl Worker {
    /// Derive a fresh channel from `connection` and wrap it in a worker
    pub async fn open(connection: Arc<Connection>) -> QueueResult<Self> {
        let (closed_tx, _) = watch::channel(false);
        let worker = Self {
            id: Uuid::new_v4(),
            connection,
            slot: Mutex::new(None),
            closed_tx,
        };
        let bound = worker.bind().await?;
        debug!(
            worker = %worker.id,
            endpoint = worker.connection.endpoint(),
            generation = bound.generation,
            "Worker opened"
        );
        Ok(worker)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn endpoint(&self) -> &str {
        self.connection.endpoint()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// `true` once the worker can no longer serve operations: it was closed
    /// or its connection failed for good
    pub fn is_defunct(&self) -> bool {
        self.is_closed() || self.connection.is_terminated()
    }

    /// Enqueue `task` on `queue`, declaring the queue first.
    ///
    /// Resolves once the broker confirmed the message.
    pub async fn put<T: Serialize + ?Sized>(&self, queue: &str, task: &T) -> QueueResult<()> {
        let payload = codec::encode(task)?;
        let size = payload.len();
        let bound = self.bind().await?;
        let generation = bound.generation;

        self.guarded(generation, bound.channel.assert_queue(queue))
            .await?;
        self.guarded(generation, bound.channel.send_to_queue(queue, payload))
            .await?;

        debug!(queue, generation, bytes = size, "Task enqueued");
        Ok(())
    }

    /// Fetch a single task from `queue` without waiting.
    ///
    /// Fails with [`QueueError::EmptyQueue`] when nothing is available. A
    /// payload that does not decode into `T` fails with
    /// [`QueueError::Serialization`] and is left unacknowledged.
    pub async fn get<T: DeserializeOwned>(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> QueueResult<Delivery<T>> {
        let bound = self.bind().await?;
        let generation = bound.generation;

        self.guarded(generation, bound.channel.assert_queue(queue))
            .await?;
        let message = self
            .guarded(generation, bound.channel.get(queue, options.no_ack))
            .await?
            .ok_or_else(|| QueueError::empty_queue(queue))?;

        if !options.no_ack {
            // The broker requeues the message once the old channel is gone
            self.ensure_live(generation)?;
        }

        let task = codec::decode(&message.payload)?;
        let ack = (!options.no_ack).then(|| self.pending_ack(&bound, message.delivery_tag));
        debug!(queue, generation, delivery_tag = message.delivery_tag, "Task fetched");
        Ok(Delivery::new(task, ack))
    }

    /// Deliver every task arriving on `queue` to `handler` until the worker
    /// is closed.
    ///
    /// Successful handler runs are acknowledged unless `options.no_ack` is
    /// set. Decode failures, handler failures and failed acknowledgements go
    /// to `on_error` and the message stays unacknowledged. After a reconnect
    /// the consumer resubscribes on the new channel.
    ///
    /// Fails with [`QueueError::Closed`] if the worker or its connection was
    /// already closed before the consumer subscribed. A running consumer
    /// returns `Ok(())` once the worker is closed, and an error if the
    /// connection is lost for good or the broker cancels the consumer.
    pub async fn consume<T, H, Fut, E>(
        &self,
        queue: &str,
        mut handler: H,
        mut on_error: E,
        options: ConsumeOptions,
    ) -> QueueResult<()>
    where
        T: DeserializeOwned,
        H: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
        E: FnMut(QueueError),
    {
        let span = queue_span!(queue = %queue, worker = %self.id);
        async move {
            let mut closed_rx = self.closed_tx.subscribe();
            // A close only ends the consumer cleanly once it has subscribed
            let mut started = false;
            let stopped = |started: bool| {
                if started {
                    Ok(())
                } else {
                    Err(QueueError::Closed)
                }
            };
            loop {
                let bound = match self.bind().await {
                    Ok(bound) => bound,
                    Err(QueueError::Closed) => return stopped(started),
                    Err(e) => return Err(e),
                };
                let generation = bound.generation;

                let subscribed = async {
                    self.guarded(generation, bound.channel.assert_queue(queue))
                        .await?;
                    self.guarded(generation, bound.channel.consume(queue, options.no_ack))
                        .await
                };
                let mut deliveries = match subscribed.await {
                    Ok(deliveries) => deliveries,
                    Err(QueueError::ChannelReset { .. }) => continue,
                    Err(QueueError::Closed) => return stopped(started),
                    Err(e) => return Err(e),
                };
                started = true;
                info!(generation, "Consumer started");

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = wait_for_signal(&mut closed_rx) => return Ok(()),
                        next = deliveries.next() => next,
                    };
                    match next {
                        Some(Ok(message)) => {
                            self.dispatch(&bound, message, &mut handler, &mut on_error, options)
                                .await;
                        }
                        Some(Err(e)) => {
                            warn!(generation, "Delivery feed failed: {}", e);
                            break;
                        }
                        None => break,
                    }
                }

                if self.is_closed() {
                    return Ok(());
                }
                if !self.holds(&bound).await
                    || self.connection.wait_past(generation, FEED_END_GRACE).await
                {
                    info!(generation, "Consumer lost its channel, resubscribing");
                    continue;
                }
                self.discard(generation).await;
                return Err(QueueError::Transport(BrokerError::Channel(format!(
                    "consumer on '{queue}' was cancelled by the broker"
                ))));
            }
        }
        .instrument(span)
        .await
    }

    /// Release the channel. Idempotent; later operations fail with
    /// [`QueueError::Closed`]. The connection stays open for other workers.
    pub async fn close(&self) -> QueueResult<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }

        let bound = self.slot.lock().await.take();
        debug!(worker = %self.id, endpoint = self.endpoint(), "Closing worker");
        match bound {
            Some(bound) if self.connection.is_live_at(bound.generation) => {
                bound.channel.close().await.map_err(QueueError::from)
            }
            _ => Ok(()),
        }
    }

    async fn dispatch<T, H, Fut, E>(
        &self,
        bound: &BoundChannel,
        message: RawMessage,
        handler: &mut H,
        on_error: &mut E,
        options: ConsumeOptions,
    ) where
        T: DeserializeOwned,
        H: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
        E: FnMut(QueueError),
    {
        let task = match codec::decode::<T>(&message.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(delivery_tag = message.delivery_tag, "Undecodable task: {}", e);
                on_error(e);
                return;
            }
        };

        if let Err(e) = handler(task).await {
            on_error(QueueError::handler(e));
            return;
        }

        if !options.no_ack {
            let acked = self
                .guarded(bound.generation, bound.channel.ack(message.delivery_tag))
                .await;
            if let Err(e) = acked {
                on_error(e);
            }
        }
    }

    /// Return the channel for the current generation, deriving a fresh one
    /// when the bound channel is stale or missing.
    async fn bind(&self) -> QueueResult<BoundChannel> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let mut slot = self.slot.lock().await;
        if let Some(bound) = slot.as_ref() {
            if self.connection.is_live_at(bound.generation) {
                return Ok(bound.clone());
            }
            debug!(worker = %self.id, generation = bound.generation, "Dropping stale channel");
            *slot = None;
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let (generation, transport) = tokio::select! {
            biased;
            _ = wait_for_signal(&mut closed_rx) => return Err(QueueError::Closed),
            ready = self.connection.ready_transport() => ready?,
        };

        let channel = transport
            .create_channel()
            .await
            .map_err(|e| self.classify(generation, e))?;
        if self.is_closed() {
            let _ = channel.close().await;
            return Err(QueueError::Closed);
        }

        let bound = BoundChannel {
            generation,
            channel,
        };
        *slot = Some(bound.clone());
        debug!(worker = %self.id, generation, "Channel bound");
        Ok(bound)
    }

    /// Run one broker call on the channel of `generation`, refusing to start
    /// it on a stale generation and classifying its failure
    async fn guarded<T>(
        &self,
        generation: u64,
        call: impl Future<Output = Result<T, BrokerError>>,
    ) -> QueueResult<T> {
        self.ensure_live(generation)?;
        match call.await {
            Ok(value) => Ok(value),
            Err(e) => {
                let error = self.classify(generation, e);
                if matches!(error, QueueError::Transport(_)) {
                    self.discard(generation).await;
                }
                Err(error)
            }
        }
    }

    fn ensure_live(&self, generation: u64) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else if !self.connection.is_live_at(generation) {
            Err(self.connection.interruption(generation))
        } else {
            Ok(())
        }
    }

    fn classify(&self, generation: u64, error: BrokerError) -> QueueError {
        if self.is_closed() {
            QueueError::Closed
        } else if self.connection.is_live_at(generation) {
            QueueError::Transport(error)
        } else {
            self.connection.interruption(generation)
        }
    }

    /// Forget the channel of `generation` after a channel-level failure so the
    /// next operation derives a new one
    async fn discard(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|bound| bound.generation == generation) {
            if let Some(bound) = slot.take() {
                if let Err(e) = bound.channel.close().await {
                    debug!(worker = %self.id, "Closing failed channel: {}", e);
                }
            }
        }
    }

    /// `true` while `bound` is still the worker's current channel
    async fn holds(&self, bound: &BoundChannel) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.channel, &bound.channel))
    }

    fn pending_ack(&self, bound: &BoundChannel, delivery_tag: u64) -> PendingAck {
        PendingAck::new(
            delivery_tag,
            bound.generation,
            bound.channel.clone(),
            self.connection.clone(),
            self.closed_tx.subscribe(),
        )
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("endpoint", &self.connection.endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}
