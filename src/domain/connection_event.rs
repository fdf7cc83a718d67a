//! Events reflecting connection lifecycle and subscription activity.
//!
//! Connection tasks report through their injected
//! [`super::ConnectionObserver`]s; the manager relays them onto its
//! [`super::EventBus`] together with its own create/remove events. Every
//! event carries the originating connection id and a timestamp.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ConnectionStatus, SubscriptionId, UpdateKind};

/// Subscription-level activity on a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSourceEvent {
    /// A subscription was registered.
    SubscriptionAdded {
        /// New subscription.
        subscription_id: SubscriptionId,
        /// Its destination.
        topic: String,
    },
    /// A subscription was removed.
    SubscriptionRemoved {
        /// Removed subscription.
        subscription_id: SubscriptionId,
        /// Its destination.
        topic: String,
    },
    /// A message was handed to a subscriber callback.
    DataReceived {
        /// Receiving subscription.
        subscription_id: SubscriptionId,
        /// Destination of the message.
        topic: String,
        /// Kind of the change, or `None` for raw bodies.
        update_kind: Option<UpdateKind>,
    },
}

/// Event emitted by a connection or by the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A connection was registered with the manager.
    ConnectionCreated {
        /// Connection id.
        connection_id: String,
        /// Display name.
        name: String,
        /// Creation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A connection was removed from the manager.
    ConnectionRemoved {
        /// Connection id.
        connection_id: String,
        /// Removal timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The connection status changed.
    StateChanged {
        /// Connection id.
        connection_id: String,
        /// Status before the transition.
        previous: ConnectionStatus,
        /// Status after the transition.
        current: ConnectionStatus,
        /// Transition timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A reconnect has been scheduled.
    Reconnecting {
        /// Connection id.
        connection_id: String,
        /// One-based number of the upcoming attempt.
        attempt: u32,
        /// Backoff before the attempt, in milliseconds.
        delay_ms: u64,
        /// Scheduling timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The broker acknowledged the session.
    Connected {
        /// Connection id.
        connection_id: String,
        /// Whether this session replaced a dropped one.
        reconnected: bool,
        /// Connection timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The session ended.
    Disconnected {
        /// Connection id.
        connection_id: String,
        /// Why the session ended.
        reason: String,
        /// `true` for caller-initiated disconnects.
        intentional: bool,
        /// Disconnect timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The connection entered the error state or reported a failure.
    Error {
        /// Connection id.
        connection_id: String,
        /// Numeric code of the underlying [`crate::error::LinkError`].
        code: u32,
        /// Error message.
        message: String,
        /// Error timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Subscription activity.
    DataSource {
        /// Connection id.
        connection_id: String,
        /// What happened.
        event: DataSourceEvent,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl ConnectionEvent {
    /// Returns the connection id associated with this event.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        match self {
            Self::ConnectionCreated { connection_id, .. }
            | Self::ConnectionRemoved { connection_id, .. }
            | Self::StateChanged { connection_id, .. }
            | Self::Reconnecting { connection_id, .. }
            | Self::Connected { connection_id, .. }
            | Self::Disconnected { connection_id, .. }
            | Self::Error { connection_id, .. }
            | Self::DataSource { connection_id, .. } => connection_id,
        }
    }

    /// Returns the timestamp of this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ConnectionCreated { timestamp, .. }
            | Self::ConnectionRemoved { timestamp, .. }
            | Self::StateChanged { timestamp, .. }
            | Self::Reconnecting { timestamp, .. }
            | Self::Connected { timestamp, .. }
            | Self::Disconnected { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::DataSource { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        match self {
            Self::ConnectionCreated { .. } => "connection_created",
            Self::ConnectionRemoved { .. } => "connection_removed",
            Self::StateChanged { .. } => "state_changed",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
            Self::DataSource { .. } => "data_source",
        }
    }
}
