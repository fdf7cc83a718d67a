//! Link error types with stable numeric codes.
//!
//! [`LinkError`] is the central error type for the crate. Each variant maps
//! to a numeric code so that collaborators (UI hooks, log pipelines) can
//! branch on the failure category without matching on message text.

/// Client-side error enum.
///
/// # Error Code Ranges
///
/// | Range     | Category            | Retried locally |
/// |-----------|---------------------|-----------------|
/// | 1000–1999 | Caller / validation | no              |
/// | 2000–2999 | Lookup              | no              |
/// | 3000–3999 | Transport           | yes (backoff)   |
/// | 4000–4999 | Protocol / payload  | no              |
/// | 5000–5999 | Internal            | no              |
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The transport could not establish or maintain a session.
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker sent a malformed handshake or frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Subscribe or publish attempted while the connection is not connected.
    #[error("connection {connection_id} is not connected")]
    NotConnected {
        /// Connection the operation targeted.
        connection_id: String,
    },

    /// A single frame body failed to parse as a data update.
    #[error("parse error: {0}")]
    Parse(String),

    /// Automatic reconnection gave up after exhausting its attempt budget.
    #[error("max reconnect attempts exceeded ({attempts})")]
    MaxReconnectAttemptsExceeded {
        /// Number of reconnect attempts that were scheduled.
        attempts: u32,
    },

    /// A connection with the same id is already registered.
    #[error("connection already exists: {0}")]
    DuplicateConnection(String),

    /// No connection with the given id is registered.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// No subscription with the given id exists on the connection.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// A publish payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The connection task is gone or an invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LinkError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::NotConnected { .. } => 1001,
            Self::DuplicateConnection(_) => 1002,
            Self::ConnectionNotFound(_) => 2001,
            Self::SubscriptionNotFound(_) => 2002,
            Self::Connection(_) => 3001,
            Self::MaxReconnectAttemptsExceeded { .. } => 3002,
            Self::Protocol(_) => 4001,
            Self::Parse(_) => 4002,
            Self::Serialization(_) => 4003,
            Self::Internal(_) => 5000,
        }
    }

    /// Returns `true` for transport and broker failures that a new attempt
    /// may avoid. Caller mistakes and an exhausted retry budget are not
    /// retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Protocol(_))
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_documented_ranges() {
        assert_eq!(
            LinkError::NotConnected {
                connection_id: "c1".to_string()
            }
            .error_code(),
            1001
        );
        assert_eq!(LinkError::ConnectionNotFound("c1".into()).error_code(), 2001);
        assert_eq!(LinkError::Connection("refused".into()).error_code(), 3001);
        assert_eq!(LinkError::Parse("bad".into()).error_code(), 4002);
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(LinkError::Connection("reset".into()).is_retryable());
        assert!(LinkError::Protocol("bad frame".into()).is_retryable());
        assert!(!LinkError::MaxReconnectAttemptsExceeded { attempts: 5 }.is_retryable());
        assert!(!LinkError::DuplicateConnection("c1".into()).is_retryable());
        assert!(!LinkError::Parse("not an update".into()).is_retryable());
        assert!(
            !LinkError::NotConnected {
                connection_id: "c1".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn not_connected_message_names_connection() {
        let err = LinkError::NotConnected {
            connection_id: "prices".to_string(),
        };
        assert_eq!(err.to_string(), "connection prices is not connected");
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let Err(err) = serde_json::from_str::<serde_json::Value>("{") else {
            panic!("expected parse failure");
        };
        let link_err = LinkError::from(err);
        assert_eq!(link_err.error_code(), 4003);
    }
}
