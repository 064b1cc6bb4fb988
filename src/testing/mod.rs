//! Testing utilities and mock implementations
//!
//! This module provides an in-memory broker so connections, workers and
//! pools can be exercised without a running AMQP server.
//!
//! ```rust
//! use amqp_worker::testing::MockBroker;
//! use amqp_worker::{ConnectionRegistry, GetOptions, ReconnectConfig, WorkerPool};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let registry = ConnectionRegistry::new(Arc::new(broker.clone()), ReconnectConfig::default());
//! let pool = WorkerPool::new(registry);
//!
//! let worker = pool.get_client("amqp://mock").await.unwrap();
//! worker.put("jobs", &serde_json::json!({"n": 1})).await.unwrap();
//! assert_eq!(broker.queue_len("jobs"), 1);
//!
//! let delivery = worker
//!     .get::<serde_json::Value>("jobs", GetOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(delivery.task["n"], 1);
//! delivery.ack().await.unwrap();
//!
//! pool.kill_all().await.unwrap();
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
