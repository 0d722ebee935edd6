//! Lifecycle events emitted by a consumer

use serde::{Deserialize, Serialize};

/// Events describing connection recovery and dispatch failures.
///
/// Failures that have no synchronous caller (replay after a reconnect,
/// handler errors inside workers) are reported here as well as in the logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsumerEvent {
    /// A connection and channel are up and the exchange is declared
    Connected { generation: u64 },

    /// The broker closed the connection without being asked to
    ConnectionLost { generation: u64, reason: String },

    /// A reconnect attempt failed; another follows after the back-off
    ReconnectFailed { attempt: u32, error: String },

    /// Reconnected and finished replaying subscriptions
    Reconnected {
        generation: u64,
        replayed: usize,
        failed: usize,
    },

    /// A subscription could not be re-established after reconnecting
    ReplayFailed { queue: String, error: String },

    /// A handler returned an error or panicked
    HandlerFailed {
        queue: String,
        delivery_tag: u64,
        error: String,
    },

    /// A delivery could not be acknowledged
    AckFailed {
        queue: String,
        delivery_tag: u64,
        error: String,
    },
}

impl ConsumerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            ConsumerEvent::Connected { .. } => "Connected",
            ConsumerEvent::ConnectionLost { .. } => "ConnectionLost",
            ConsumerEvent::ReconnectFailed { .. } => "ReconnectFailed",
            ConsumerEvent::Reconnected { .. } => "Reconnected",
            ConsumerEvent::ReplayFailed { .. } => "ReplayFailed",
            ConsumerEvent::HandlerFailed { .. } => "HandlerFailed",
            ConsumerEvent::AckFailed { .. } => "AckFailed",
        }
    }

    /// Queue the event concerns, if any
    pub fn queue(&self) -> Option<&str> {
        match self {
            ConsumerEvent::ReplayFailed { queue, .. }
            | ConsumerEvent::HandlerFailed { queue, .. }
            | ConsumerEvent::AckFailed { queue, .. } => Some(queue),
            _ => None,
        }
    }
}
