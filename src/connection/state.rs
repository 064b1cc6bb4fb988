//! Pure connection state types
//!
//! Connection states, the fixed reconnect policy and the events that drive
//! transitions between states. No I/O happens here.

use crate::transport::BrokerConnection;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a managed broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial dial in progress
    Connecting,
    /// Transport is up; channels may be derived
    Ready,
    /// Transport reported an error or unexpected close
    Disconnected(String),
    /// Reconnection attempt in progress (1-based attempt number)
    Reconnecting(u32),
    /// Retry budget exhausted; terminal
    Failed(String),
    /// Closed on request; terminal
    Closed,
}

impl ConnectionState {
    /// Terminal states never go back to `Ready`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }
}

/// Reconnection policy: a fixed number of attempts with a fixed pause
/// between consecutive attempts. No exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts made after a disconnect before giving up
    pub max_attempts: u32,
    /// Pause between two consecutive attempts
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectConfig {
    /// Upper bound on the time spent sleeping between attempts before the
    /// connection is declared failed
    pub fn max_total_delay(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }

    /// Delay to wait before the given 1-based attempt.
    /// The first attempt runs immediately after the disconnect.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Initial dial failed
    ConnectFailed(String),
    /// Transport established (initial connect or reconnect)
    Established,
    /// Transport error or unexpected close
    TransportLost(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Retry budget exhausted
    RetriesExhausted(u32),
    /// Closed on request
    Shutdown,
}

/// Snapshot of a connection published to every observer.
///
/// `generation` counts successful (re)connects: 0 before the first connect,
/// 1 after it, +1 for every successful reconnect. A channel derived at
/// generation N is stale as soon as the link leaves `Ready` at N.
#[derive(Clone)]
pub struct Link {
    pub(crate) state: ConnectionState,
    pub(crate) generation: u64,
    pub(crate) transport: Option<Arc<dyn BrokerConnection>>,
}

impl Link {
    pub(crate) fn connecting() -> Self {
        Self {
            state: ConnectionState::Connecting,
            generation: 0,
            transport: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` while the link is `Ready` at exactly `generation`
    pub fn is_live_at(&self, generation: u64) -> bool {
        self.state == ConnectionState::Ready && self.generation == generation
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}
