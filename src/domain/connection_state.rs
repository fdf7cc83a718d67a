//! Connection status, metrics and point-in-time snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session. Initial state, and terminal after an intentional close.
    #[default]
    Disconnected,
    /// Dialing or waiting for the broker's `CONNECTED` frame.
    Connecting,
    /// Session established; subscriptions are live.
    Connected,
    /// Handshake failed or reconnection gave up.
    Error,
}

impl ConnectionStatus {
    /// Returns the status as a static string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters maintained by a connection task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    /// Frames published through `SEND`.
    pub messages_sent: u64,
    /// `MESSAGE` frames received.
    pub messages_received: u64,
    /// Successful reconnections.
    pub reconnect_count: u64,
    /// Connection-level failures (dial, handshake, drops, broker errors).
    pub error_count: u64,
    /// Message bodies that were JSON but not a valid change event.
    pub parse_errors: u64,
}

/// Point-in-time view of a connection, published by its task after every
/// transition or counter change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    /// Connection id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Broker endpoint.
    pub url: String,
    /// Current state.
    pub status: ConnectionStatus,
    /// When the current (or last) session was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last session ended.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Reconnects scheduled since the last successful connection.
    pub reconnect_attempts: u32,
    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Counters.
    pub metrics: ConnectionMetrics,
    /// Number of registered subscriptions.
    pub subscription_count: usize,
}

impl ConnectionSnapshot {
    /// Creates the initial snapshot of a fresh connection.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            disconnected_at: None,
            reconnect_attempts: 0,
            reconnect_pending: false,
            last_error: None,
            metrics: ConnectionMetrics::default(),
            subscription_count: 0,
        }
    }

    /// Returns `true` if the connection is fully idle: disconnected with no
    /// reconnect pending.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.status, ConnectionStatus::Disconnected) && !self.reconnect_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::Connecting).unwrap_or_default();
        assert_eq!(json, "\"connecting\"");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
    }

    #[test]
    fn fresh_snapshot_is_idle() {
        let snap = ConnectionSnapshot::new("c1", "Prices", "ws://broker/ws");
        assert!(snap.is_idle());
        assert_eq!(snap.metrics, ConnectionMetrics::default());
    }

    #[test]
    fn pending_reconnect_is_not_idle() {
        let mut snap = ConnectionSnapshot::new("c1", "Prices", "ws://broker/ws");
        snap.reconnect_pending = true;
        assert!(!snap.is_idle());
    }
}
