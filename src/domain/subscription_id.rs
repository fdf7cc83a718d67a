//! Type-safe subscription identifier.
//!
//! [`SubscriptionId`] is a newtype wrapper around [`uuid::Uuid`] (v4) so that
//! subscription identifiers cannot be confused with connection ids or topic
//! strings. Its string form is used as the STOMP `id` header of the
//! transport-level subscription.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a subscription.
///
/// Generated once by `subscribe` and stable across reconnects: the replayed
/// transport subscription reuses the same id, so inbound `MESSAGE` frames
/// keep routing to the same registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    /// Creates a new random `SubscriptionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `SubscriptionId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl From<uuid::Uuid> for SubscriptionId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}
