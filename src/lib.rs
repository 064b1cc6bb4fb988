//! AMQP worker - resilient queue client
//!
//! Keeps one managed connection per broker endpoint, reconnects it on
//! failure with a fixed retry budget, and exposes put/get/consume on top of
//! it through [`Worker`] handles that survive reconnects.
//!
//! # Overview
//!
//! - [`transport`] - broker traits plus the lapin-backed AMQP implementation
//! - [`connection`] - the reconnect state machine and its supervisor task
//! - [`registry`] - deduplicated connection acquisition per endpoint
//! - [`worker`] - the queue handle: put, get (with explicit ack), consume
//! - [`pool`] - shared workers per endpoint and bulk teardown
//!
//! # Quick Start
//!
//! ```no_run
//! use amqp_worker::{GetOptions, ReconnectConfig, WorkerPool};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::amqp(ReconnectConfig::default());
//! let worker = pool.get_client("amqp://127.0.0.1:5672/%2f").await?;
//!
//! worker.put("thumbnails", &json!({"image": "cat.png", "width": 640})).await?;
//!
//! let delivery = worker
//!     .get::<serde_json::Value>("thumbnails", GetOptions::default())
//!     .await?;
//! println!("processing {}", delivery.task);
//! delivery.ack().await?;
//!
//! pool.kill_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
mod inflight;
pub mod observability;
pub mod pool;
pub mod registry;
pub mod testing;
pub mod transport;
pub mod worker;

pub use config::{ConfigError, WorkerConfig};
pub use connection::{Connection, ConnectionState, HealthMetrics, ReconnectConfig};
pub use error::{HandlerError, KillAllError, QueueError, QueueResult};
pub use pool::WorkerPool;
pub use registry::ConnectionRegistry;
pub use transport::{AmqpBroker, Broker, BrokerChannel, BrokerConnection, BrokerError};
pub use worker::{ConsumeOptions, Delivery, GetOptions, PendingAck, QueueClient, Worker};
