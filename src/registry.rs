//! Endpoint-keyed connection registry
//!
//! Holds at most one managed [`Connection`] per endpoint string. Endpoints are
//! exact-match keys: `amqp://host` and `amqp://host/` are different entries.

use crate::connection::{Connection, FailureHook, ReconnectConfig};
use crate::error::QueueResult;
use crate::inflight::InflightMap;
use crate::transport::{AmqpBroker, Broker};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of managed connections, one per endpoint.
///
/// Cheap to clone; clones share the same table. Create one per application
/// (or per test) and tear it down with [`crate::WorkerPool::kill_all`] or
/// [`ConnectionRegistry::release`].
#[derive(Clone)]
pub struct ConnectionRegistry {
    broker: Arc<dyn Broker>,
    reconnect_config: ReconnectConfig,
    connections: Arc<InflightMap<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(broker: Arc<dyn Broker>, reconnect_config: ReconnectConfig) -> Self {
        Self {
            broker,
            reconnect_config,
            connections: Arc::new(InflightMap::new()),
        }
    }

    /// Registry backed by the lapin AMQP transport
    pub fn amqp(reconnect_config: ReconnectConfig) -> Self {
        Self::new(Arc::new(AmqpBroker::new()), reconnect_config)
    }

    /// Return the connection for `endpoint`, dialing it if needed.
    ///
    /// Concurrent callers for the same endpoint share a single connect call and
    /// all observe its outcome. A connection that failed for good or was closed
    /// is replaced by a fresh dial.
    pub async fn acquire(&self, endpoint: &str) -> QueueResult<Arc<Connection>> {
        let broker = self.broker.clone();
        let reconnect_config = self.reconnect_config.clone();
        let owned_endpoint = endpoint.to_string();

        let pending = self.connections.get_or_start(
            endpoint,
            |connection| connection.is_terminated(),
            move |eviction| async move {
                let on_failed: FailureHook = Box::new(move || {
                    debug!("Evicting failed connection from registry");
                    eviction.evict();
                });
                Connection::establish(&owned_endpoint, broker, reconnect_config, Some(on_failed))
                    .await
            },
        );
        pending.await
    }

    /// Drop the registry entry for `endpoint` and close its connection.
    ///
    /// Idempotent: releasing an unknown endpoint is a no-op.
    pub async fn release(&self, endpoint: &str) -> QueueResult<()> {
        let Some(pending) = self.connections.remove(endpoint) else {
            debug!(endpoint, "Release of unknown endpoint ignored");
            return Ok(());
        };

        match pending.await {
            Ok(connection) => {
                info!(endpoint, "Releasing broker connection");
                connection.close().await
            }
            Err(e) => {
                // Nothing to close: the connection never came up
                warn!(endpoint, "Released endpoint whose connect had failed: {}", e);
                Ok(())
            }
        }
    }

    /// Connection for `endpoint` if one is established and not terminated
    pub fn get(&self, endpoint: &str) -> Option<Arc<Connection>> {
        let pending = self.connections.get(endpoint)?;
        match pending.peek() {
            Some(Ok(connection)) if !connection.is_terminated() => Some(connection.clone()),
            _ => None,
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.connections.endpoints()
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.connections.contains(endpoint)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect_config
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("endpoints", &self.endpoints())
            .field("reconnect_config", &self.reconnect_config)
            .finish()
    }
}
