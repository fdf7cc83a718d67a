//! What a subscriber callback receives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{DataUpdate, SubscriptionId};

/// Body of a delivered message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Body parsed into a validated change event.
    Update(DataUpdate),
    /// Body that was not JSON, passed through untouched.
    Raw(String),
}

impl Payload {
    /// Returns the change event, if the body was one.
    #[must_use]
    pub const fn as_update(&self) -> Option<&DataUpdate> {
        match self {
            Self::Update(update) => Some(update),
            Self::Raw(_) => None,
        }
    }
}

/// One message routed to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Subscription the message was routed to.
    pub subscription_id: SubscriptionId,
    /// Destination the message was published on.
    pub topic: String,
    /// Parsed body.
    pub payload: Payload,
    /// STOMP headers of the `MESSAGE` frame.
    pub headers: BTreeMap<String, String>,
    /// When the frame was decoded.
    pub received_at: DateTime<Utc>,
}
