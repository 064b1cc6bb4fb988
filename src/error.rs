//! Error types for the worker and connection manager
//!
//! Every failure a caller can observe is a distinct [`QueueError`] variant so
//! "queue empty", "connection broken" and "malformed payload" can be told
//! apart by kind rather than by message text.

use crate::transport::BrokerError;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error a consume handler may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for worker operations.
///
/// `Clone` so one in-flight connection attempt can hand the same outcome to
/// every caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: BrokerError,
    },

    #[error("Connection to {endpoint} lost after {attempts} failed reconnection attempts")]
    ConnectionLost { endpoint: String, attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("No more messages in queue '{queue}'")]
    EmptyQueue { queue: String },

    #[error("Serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    #[error("Worker is closed")]
    Closed,

    #[error("Channel reset: operation started on connection generation {generation}, which is no longer live")]
    ChannelReset { generation: u64 },

    #[error("Task handler failed: {0}")]
    Handler(Arc<dyn std::error::Error + Send + Sync>),
}

impl QueueError {
    /// Create connect error
    pub fn connect<S: Into<String>>(endpoint: S, source: BrokerError) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create empty queue error
    pub fn empty_queue<S: Into<String>>(queue: S) -> Self {
        Self::EmptyQueue {
            queue: queue.into(),
        }
    }

    /// Wrap a consume handler failure
    pub fn handler(error: HandlerError) -> Self {
        Self::Handler(Arc::from(error))
    }

    /// `true` for the expected, non-fatal "nothing to read" outcome of `get`
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, Self::EmptyQueue { .. })
    }

    /// Whether reissuing the same operation on the same worker may succeed.
    ///
    /// Channel resets and transport errors are transient while the connection
    /// recovers; a lost connection or a closed worker needs a new worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChannelReset { .. } | Self::Transport(_) | Self::EmptyQueue { .. }
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(error))
    }
}

/// Aggregate failure of a pool-wide teardown.
///
/// Teardown of every endpoint is attempted; this lists the ones that did not
/// shut down cleanly.
#[derive(Debug, Error)]
#[error("{count} endpoint(s) failed to shut down cleanly", count = .failures.len())]
pub struct KillAllError {
    pub failures: Vec<(String, QueueError)>,
}

impl KillAllError {
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(endpoint, _)| endpoint.as_str())
    }
}

/// Result type for worker operations
pub type QueueResult<T> = Result<T, QueueError>;
