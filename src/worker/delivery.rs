//! Received tasks and their acknowledgement capability

use crate::connection::Connection;
use crate::error::{QueueError, QueueResult};
use crate::transport::BrokerChannel;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Right to acknowledge exactly one received message.
///
/// `ack` consumes the capability, so a message cannot be acknowledged twice.
/// Acknowledging after the owning worker was closed fails with
/// [`QueueError::Closed`]; after the connection reconnected it fails with
/// [`QueueError::ChannelReset`] and the broker redelivers the message.
pub struct PendingAck {
    delivery_tag: u64,
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    connection: Arc<Connection>,
    closed_rx: watch::Receiver<bool>,
}

impl PendingAck {
    pub(crate) fn new(
        delivery_tag: u64,
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
        connection: Arc<Connection>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            delivery_tag,
            generation,
            channel,
            connection,
            closed_rx,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Generation of the channel the message was received on
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tell the broker the task is fully processed
    pub async fn ack(self) -> QueueResult<()> {
        if *self.closed_rx.borrow() {
            return Err(QueueError::Closed);
        }
        if !self.connection.is_live_at(self.generation) {
            return Err(self.connection.interruption(self.generation));
        }

        match self.channel.ack(self.delivery_tag).await {
            Ok(()) => {
                debug!(delivery_tag = self.delivery_tag, "Message acknowledged");
                Ok(())
            }
            Err(_) if *self.closed_rx.borrow() => Err(QueueError::Closed),
            Err(_) if !self.connection.is_live_at(self.generation) => {
                Err(self.connection.interruption(self.generation))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAck")
            .field("delivery_tag", &self.delivery_tag)
            .field("generation", &self.generation)
            .finish()
    }
}

/// A task fetched with [`crate::Worker::get`]
///
/// Derefs to the task. When the fetch required acknowledgement the delivery
/// carries a [`PendingAck`]; otherwise the broker already considers the
/// message consumed.
#[derive(Debug)]
pub struct Delivery<T> {
    pub task: T,
    ack: Option<PendingAck>,
}

impl<T> Delivery<T> {
    pub(crate) fn new(task: T, ack: Option<PendingAck>) -> Self {
        Self { task, ack }
    }

    pub fn requires_ack(&self) -> bool {
        self.ack.is_some()
    }

    pub fn into_parts(self) -> (T, Option<PendingAck>) {
        (self.task, self.ack)
    }

    /// Acknowledge (if required) and hand back the task
    pub async fn ack(self) -> QueueResult<T> {
        if let Some(ack) = self.ack {
            ack.ack().await?;
        }
        Ok(self.task)
    }
}

impl<T> Deref for Delivery<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.task
    }
}
