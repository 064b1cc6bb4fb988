//! Endpoint-keyed worker cache with bulk teardown
//!
//! [`WorkerPool::get_client`] hands out one shared [`Worker`] per endpoint;
//! [`WorkerPool::spawn_worker`] derives an extra, uncached worker from the
//! same managed connection. [`WorkerPool::kill`] and
//! [`WorkerPool::kill_all`] tear workers and connections down together.

use crate::connection::{Connection, ReconnectConfig};
use crate::error::{KillAllError, QueueResult};
use crate::inflight::InflightMap;
use crate::registry::ConnectionRegistry;
use crate::worker::Worker;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Cache of shared workers, one per endpoint
#[derive(Clone)]
pub struct WorkerPool {
    registry: ConnectionRegistry,
    workers: Arc<InflightMap<Arc<Worker>>>,
}

impl WorkerPool {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            workers: Arc::new(InflightMap::new()),
        }
    }

    /// Pool over the lapin AMQP transport
    pub fn amqp(reconnect_config: ReconnectConfig) -> Self {
        Self::new(ConnectionRegistry::amqp(reconnect_config))
    }

    /// Shared worker for `endpoint`.
    ///
    /// Concurrent callers for the same endpoint receive the same worker (or
    /// the same failure). A worker that was closed or whose connection was
    /// lost for good is replaced on the next call.
    pub async fn get_client(&self, endpoint: &str) -> QueueResult<Arc<Worker>> {
        let registry = self.registry.clone();
        let owned_endpoint = endpoint.to_string();

        self.workers
            .get_or_start(
                endpoint,
                |worker| worker.is_defunct(),
                move |_eviction| async move {
                    let connection = registry.acquire(&owned_endpoint).await?;
                    let worker = Worker::open(connection).await?;
                    debug!(endpoint = %owned_endpoint, worker = %worker.id(), "Pooled worker ready");
                    Ok(Arc::new(worker))
                },
            )
            .await
    }

    /// New worker with its own channel on the managed connection for
    /// `endpoint`. Not cached; the caller owns and closes it.
    pub async fn spawn_worker(&self, endpoint: &str) -> QueueResult<Worker> {
        let connection = self.registry.acquire(endpoint).await?;
        Worker::open(connection).await
    }

    /// Close the pooled worker and the connection for `endpoint` and forget
    /// both. Idempotent.
    ///
    /// Both steps are attempted; the first failure is returned.
    pub async fn kill(&self, endpoint: &str) -> QueueResult<()> {
        let mut first_error = None;

        if let Some(pending) = self.workers.remove(endpoint) {
            if let Ok(worker) = pending.await {
                if let Err(e) = worker.close().await {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.registry.release(endpoint).await {
            first_error.get_or_insert(e);
        }

        match first_error {
            None => {
                info!(endpoint, "Endpoint torn down");
                Ok(())
            }
            Some(e) => {
                error!(endpoint, "Endpoint teardown failed: {}", e);
                Err(e)
            }
        }
    }

    /// [`kill`](Self::kill) every known endpoint.
    ///
    /// One endpoint failing does not stop the others; every failure is
    /// reported in the returned [`KillAllError`].
    pub async fn kill_all(&self) -> Result<(), KillAllError> {
        let endpoints: BTreeSet<String> = self
            .workers
            .endpoints()
            .into_iter()
            .chain(self.registry.endpoints())
            .collect();
        info!(count = endpoints.len(), "Tearing down all endpoints");

        let results = join_all(endpoints.into_iter().map(|endpoint| async move {
            let result = self.kill(&endpoint).await;
            (endpoint, result)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(endpoint, result)| result.err().map(|e| (endpoint, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KillAllError { failures })
        }
    }

    /// Live managed connection for `endpoint`, if any
    pub fn connection(&self, endpoint: &str) -> Option<Arc<Connection>> {
        self.registry.get(endpoint)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Endpoints with a pooled worker (ready or still being created)
    pub fn endpoints(&self) -> Vec<String> {
        self.workers.endpoints()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.endpoints())
            .field("registry", &self.registry)
            .finish()
    }
}
