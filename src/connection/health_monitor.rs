//! Pure health monitoring and reconnection logic
//!
//! Decides whether another reconnection attempt is due, maps connection
//! events onto states, and summarises connection health. No I/O happens here.

use super::state::{ConnectionEvent, ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to make another reconnection attempt
    pub fn should_attempt_reconnection(
        attempts_made: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if attempts_made >= config.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = attempts_made + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: config.delay_before(attempt),
        }
    }

    /// Determine next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectFailed(reason) => {
                warn!("Initial broker connection failed: {}", reason);
                ConnectionState::Failed(reason)
            }
            ConnectionEvent::Established => ConnectionState::Ready,
            ConnectionEvent::TransportLost(reason) => {
                warn!("Broker connection lost: {}", reason);
                ConnectionState::Disconnected(reason)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::RetriesExhausted(attempts) => {
                let reason = format!("Max reconnection attempts ({attempts}) exceeded");
                error!("Permanent connection failure: {}", reason);
                ConnectionState::Failed(reason)
            }
            ConnectionEvent::Shutdown => ConnectionState::Closed,
        }
    }

    /// Check if connection state allows queue operations
    pub fn can_operate(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Ready)
    }

    /// Calculate health metrics for a connection
    pub fn calculate_health_metrics(
        state: &ConnectionState,
        generation: u64,
        connected_at: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let uptime = connected_at
            .filter(|_| Self::can_operate(state))
            .map(|t| t.elapsed());

        HealthMetrics {
            state: state.clone(),
            generation,
            uptime,
            reconnect_count,
            is_healthy: Self::can_operate(state),
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(endpoint: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Ready) => {
                info!(endpoint, "Broker connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Ready) => {
                info!(endpoint, attempt, "Reconnection successful");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(endpoint, attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::Closed) => {
                info!(endpoint, "Broker connection closed");
            }
            _ => {
                tracing::debug!(endpoint, "Connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnect configuration
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }

        if config.delay.is_zero() {
            return Err("delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Health metrics for a managed connection
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub state: ConnectionState,
    /// Successful (re)connects so far
    pub generation: u64,
    /// Time since the current transport was established
    pub uptime: Option<Duration>,
    /// Number of successful reconnects
    pub reconnect_count: u32,
    pub is_healthy: bool,
}
