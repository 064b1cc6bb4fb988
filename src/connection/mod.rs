//! Managed broker connections
//!
//! The module separates pure state handling from the I/O that drives it:
//!
//! - [`state`] - connection states, reconnect policy and transition events
//! - [`health_monitor`] - pure reconnection decisions and health metrics
//! - [`managed`] - the [`Connection`] itself and its reconnection supervisor
//!
//! State machine:
//!
//! ```text
//! Connecting -> Ready -> Disconnected -> Reconnecting(n) -> Ready (generation + 1)
//!                                                     \-> Failed (budget exhausted)
//! any non-terminal state -> Closed (explicit close)
//! ```

pub mod health_monitor;
pub mod managed;
pub mod state;

pub use health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use managed::{Connection, FailureHook};
pub use state::{ConnectionEvent, ConnectionState, Link, ReconnectConfig};
