//! Connection state machine for the supervisor.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Connecting -> ...
//!                                   any  -> Closed (shutdown, terminal)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current state of the supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection, no attempt in progress
    Disconnected,
    /// Dialing, opening the channel and declaring the exchange
    Connecting,
    /// Connection and channel are usable
    Connected,
    /// The broker closed the connection; waiting out the back-off
    Closing,
    /// Shut down by the caller; no further reconnects
    Closed,
}

impl ConnectionState {
    /// Convert state to numeric value for Prometheus gauge
    pub fn to_metric_value(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Closing => 3.0,
            ConnectionState::Closed => 4.0,
        }
    }

    /// Check if registrations and publishes may use the channel
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if this state is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) | (Connecting, Closing) => true,
            (Connected, Closing) => true,
            (Closing, Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Represents a state transition of the connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ConnectionState,
    /// New state
    pub to: ConnectionState,
    /// When the transition occurred
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition
    pub reason: String,
}

impl StateTransition {
    /// Create a new state transition
    pub fn new(from: ConnectionState, to: ConnectionState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Internal state data for the supervisor
#[derive(Debug, Clone)]
pub struct StateData {
    /// Current state
    pub state: ConnectionState,
    /// When the state was last changed
    pub last_state_change: DateTime<Utc>,
    /// When the connection was last lost
    pub lost_at: Option<DateTime<Utc>>,
    /// Reconnect attempts since the connection was lost
    pub reconnect_attempts: u32,
    /// Total number of state transitions
    pub transition_count: u64,
}

impl StateData {
    /// Create new state data in Disconnected state
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_state_change: Utc::now(),
            lost_at: None,
            reconnect_attempts: 0,
            transition_count: 0,
        }
    }

    /// Transition to a new state.
    ///
    /// Returns `None` and leaves the data untouched when the move is illegal.
    pub fn transition_to(
        &mut self,
        new_state: ConnectionState,
        reason: impl Into<String>,
    ) -> Option<StateTransition> {
        if !self.state.can_transition_to(new_state) {
            return None;
        }

        let transition = StateTransition::new(self.state, new_state, reason);

        self.state = new_state;
        self.last_state_change = Utc::now();
        self.transition_count += 1;

        match new_state {
            ConnectionState::Closing => {
                // failed reconnect attempts pass through Closing again
                self.lost_at.get_or_insert_with(Utc::now);
            }
            ConnectionState::Connected => {
                self.lost_at = None;
                self.reconnect_attempts = 0;
            }
            _ => {}
        }

        Some(transition)
    }

    /// Record a failed reconnect attempt, returning the running count
    pub fn record_attempt(&mut self) -> u32 {
        self.reconnect_attempts += 1;
        self.reconnect_attempts
    }
}

impl Default for StateData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_metric_values() {
        assert_eq!(ConnectionState::Disconnected.to_metric_value(), 0.0);
        assert_eq!(ConnectionState::Connected.to_metric_value(), 2.0);
        assert_eq!(ConnectionState::Closed.to_metric_value(), 4.0);
    }

    #[test]
    fn test_recovery_cycle() {
        let mut data = StateData::new();
        assert_eq!(data.state, ConnectionState::Disconnected);

        assert!(data.transition_to(ConnectionState::Connecting, "dial").is_some());
        assert!(data.transition_to(ConnectionState::Connected, "up").is_some());
        assert!(data.transition_to(ConnectionState::Closing, "reset").is_some());
        assert!(data.lost_at.is_some());

        assert_eq!(data.record_attempt(), 1);
        assert!(data.transition_to(ConnectionState::Connecting, "retry").is_some());
        assert!(data.transition_to(ConnectionState::Closing, "dial failed").is_some());
        assert!(data.transition_to(ConnectionState::Connecting, "retry").is_some());
        assert!(data.transition_to(ConnectionState::Connected, "up").is_some());

        assert!(data.lost_at.is_none());
        assert_eq!(data.reconnect_attempts, 0);
        assert_eq!(data.transition_count, 7);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut data = StateData::new();
        assert!(data.transition_to(ConnectionState::Connected, "skip").is_none());
        assert_eq!(data.state, ConnectionState::Disconnected);
        assert_eq!(data.transition_count, 0);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut data = StateData::new();
        let transition = data.transition_to(ConnectionState::Closed, "shutdown").unwrap();
        assert_eq!(transition.from, ConnectionState::Disconnected);
        assert!(data.state.is_terminal());
        assert!(data.transition_to(ConnectionState::Connecting, "retry").is_none());
    }

    #[test]
    fn test_only_connected_is_usable() {
        assert!(ConnectionState::Connected.is_usable());
        assert!(!ConnectionState::Closing.is_usable());
        assert!(!ConnectionState::Connecting.is_usable());
    }
}
