//! Transport layer for broker communication
//!
//! This module provides the transport abstraction the connection manager is
//! written against, plus the AMQP implementation backed by lapin. Everything
//! above this layer (connections, workers, pools) only sees these traits, so
//! tests can swap in [`crate::testing::MockBroker`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

pub mod amqp;

pub use amqp::AmqpBroker;

/// Failures reported by the broker client library
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// A message as handed over by the broker, before task decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Channel-scoped tag used to acknowledge this message
    pub delivery_tag: u64,
    pub payload: Bytes,
}

/// Push-style delivery feed returned by [`BrokerChannel::consume`].
///
/// The stream ends (or yields an error) once the channel it was opened on
/// is closed.
pub type DeliveryStream = BoxStream<'static, Result<RawMessage, BrokerError>>;

/// Entry point of the broker client library
#[async_trait]
pub trait Broker: Send + Sync {
    /// Dial the broker at `endpoint`
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One live transport to a broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a publisher-confirm channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolve once the transport reports an error or an unexpected close
    async fn closed(&self) -> BrokerError;

    /// Close the transport
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical session multiplexed over a [`BrokerConnection`]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `queue` with default options; a no-op if it already exists
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish `payload` to `queue` through the default exchange and wait
    /// for the broker's confirm
    async fn send_to_queue(&self, queue: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Fetch a single message without blocking; `None` when the queue is empty
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawMessage>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Register a consumer on `queue`
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
