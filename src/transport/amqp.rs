//! AMQP 0-9-1 transport backed by lapin
//!
//! Thin adapters from the transport traits onto `lapin::Connection` and
//! `lapin::Channel`. Every channel is switched to publisher-confirm mode so
//! a completed `send_to_queue` means the broker accepted the message.

use super::{Broker, BrokerChannel, BrokerConnection, BrokerError, DeliveryStream, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// Production [`Broker`] dialing RabbitMQ (or any AMQP 0-9-1 broker) via lapin
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

/// Check that `endpoint` is an `amqp://` or `amqps://` URL with a host.
///
/// Only validates; the endpoint string is passed to lapin untouched.
pub fn validate_endpoint(endpoint: &str) -> Result<(), BrokerError> {
    let url =
        Url::parse(endpoint).map_err(|_| BrokerError::InvalidEndpoint(endpoint.to_string()))?;

    match url.scheme() {
        "amqp" | "amqps" => {}
        other => {
            return Err(BrokerError::InvalidEndpoint(format!(
                "unsupported scheme '{other}' in {endpoint}"
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(BrokerError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok(())
}

fn channel_error(error: lapin::Error) -> BrokerError {
    BrokerError::Channel(error.to_string())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        validate_endpoint(endpoint)?;

        let connection = Connection::connect(endpoint, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let (error_tx, error_rx) = watch::channel(None);
        connection.on_error(move |error| {
            warn!("AMQP connection error: {}", error);
            error_tx.send_replace(Some(BrokerError::Closed(error.to_string())));
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            error_rx,
        }))
    }
}

struct AmqpConnection {
    inner: Connection,
    error_rx: watch::Receiver<Option<BrokerError>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await.map_err(channel_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;

        debug!(channel_id = channel.id(), "Opened confirm channel");
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn closed(&self) -> BrokerError {
        let mut error_rx = self.error_rx.clone();
        loop {
            let reported = error_rx.borrow_and_update().clone();
            if let Some(error) = reported {
                return error;
            }
            if error_rx.changed().await.is_err() {
                return BrokerError::Closed("error handler dropped".to_string());
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Closed(e.to_string()))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map(|_| ())
            .map_err(channel_error)
    }

    async fn send_to_queue(&self, queue: &str, payload: Bytes) -> Result<(), BrokerError> {
        let confirm = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(channel_error)?;

        let confirmation = confirm.await.map_err(channel_error)?;
        if confirmation.is_nack() {
            return Err(BrokerError::Channel(format!(
                "broker rejected message for queue '{queue}'"
            )));
        }
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawMessage>, BrokerError> {
        let message = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
            .map_err(channel_error)?;

        Ok(message.map(|message| RawMessage {
            delivery_tag: message.delivery.delivery_tag,
            payload: Bytes::from(message.delivery.data),
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, BrokerError> {
        let consumer_tag = format!("amqp-worker-{}", Uuid::new_v4());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        debug!(queue, consumer_tag = %consumer_tag, "Registered consumer");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| RawMessage {
                        delivery_tag: delivery.delivery_tag,
                        payload: Bytes::from(delivery.data),
                    })
                    .map_err(channel_error)
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(channel_error)
    }
}
