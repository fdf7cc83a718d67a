//! Per-connection subscription registry.
//!
//! The registry is the durable record of what the caller asked for: topic,
//! filter, throttle and callback. It outlives transport sessions; each
//! entry only tracks whether it is currently attached to the live session.
//! Reconnection replays the registry and never clears it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Delivery, Payload, SubscriptionId};

/// Subscriber callback. Invoked on the connection task, in delivery order.
pub type MessageCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Predicate deciding whether a payload reaches the callback.
pub type MessageFilter = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

/// Options accepted by `subscribe`.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Drop payloads for which this returns `false`.
    pub filter: Option<MessageFilter>,
    /// Buffer deliveries and flush them once per interval.
    pub throttle: Option<Duration>,
    /// Extra headers on the `SUBSCRIBE` frame.
    pub headers: BTreeMap<String, String>,
}

impl SubscribeOptions {
    /// Sets the filter.
    #[must_use]
    pub fn filter(mut self, filter: impl Fn(&Payload) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sets the throttle interval. A zero interval disables throttling.
    #[must_use]
    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Adds a `SUBSCRIBE` header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("filter", &self.filter.is_some())
            .field("throttle", &self.throttle)
            .field("headers", &self.headers)
            .finish()
    }
}

/// One registered subscription.
pub struct SubscriptionEntry {
    /// Subscription id, also the STOMP subscription `id`.
    pub id: SubscriptionId,
    /// Destination.
    pub topic: String,
    /// Subscribe options.
    pub options: SubscribeOptions,
    /// Delivery callback.
    pub callback: MessageCallback,
    /// Whether a transport subscription exists on the live session.
    pub attached: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Messages handed to the callback.
    pub delivered: u64,
}

impl SubscriptionEntry {
    /// Returns `true` if `payload` passes the filter.
    #[must_use]
    pub fn accepts(&self, payload: &Payload) -> bool {
        self.options.filter.as_ref().is_none_or(|filter| filter(payload))
    }

    /// Returns a serializable summary.
    #[must_use]
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            topic: self.topic.clone(),
            throttle_ms: self
                .options
                .throttle
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            filtered: self.options.filter.is_some(),
            attached: self.attached,
            created_at: self.created_at,
            delivered: self.delivered,
        }
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("options", &self.options)
            .field("attached", &self.attached)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Destination.
    pub topic: String,
    /// Throttle interval in milliseconds, if any.
    pub throttle_ms: Option<u64>,
    /// Whether a filter is installed.
    pub filtered: bool,
    /// Whether the subscription is attached to the live session.
    pub attached: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Messages delivered so far.
    pub delivered: u64,
}

/// Subscriptions of one connection, in registration order.
///
/// Several subscriptions may share a topic; each one gets its own transport
/// subscription and is torn down independently.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    order: Vec<SubscriptionId>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription and returns its generated id. The entry
    /// starts detached.
    pub fn subscribe(
        &mut self,
        topic: impl Into<String>,
        callback: MessageCallback,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.entries.insert(
            id,
            SubscriptionEntry {
                id,
                topic: topic.into(),
                options,
                callback,
                attached: false,
                created_at: Utc::now(),
                delivered: 0,
            },
        );
        self.order.push(id);
        id
    }

    /// Removes a subscription and returns it.
    pub fn unsubscribe(&mut self, id: &SubscriptionId) -> Option<SubscriptionEntry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|other| other != id);
        Some(entry)
    }

    /// Returns the entry for `id`.
    #[must_use]
    pub fn get(&self, id: &SubscriptionId) -> Option<&SubscriptionEntry> {
        self.entries.get(id)
    }

    /// Returns the entry for `id` mutably.
    pub fn get_mut(&mut self, id: &SubscriptionId) -> Option<&mut SubscriptionEntry> {
        self.entries.get_mut(id)
    }

    /// Marks every entry attached and returns them in registration order.
    /// Used for replay after (re)connecting.
    pub fn attach_all(&mut self) -> Vec<&SubscriptionEntry> {
        for entry in self.entries.values_mut() {
            entry.attached = true;
        }
        self.iter().collect()
    }

    /// Marks every entry detached and returns the ids that were attached,
    /// in registration order.
    pub fn detach_all(&mut self) -> Vec<SubscriptionId> {
        let attached: Vec<SubscriptionId> = self
            .order
            .iter()
            .filter(|id| self.entries.get(id).is_some_and(|e| e.attached))
            .copied()
            .collect();
        for entry in self.entries.values_mut() {
            entry.attached = false;
        }
        attached
    }

    /// Returns the set of topics with an attached transport subscription.
    #[cfg(test)]
    pub(crate) fn attached_topics(&self) -> std::collections::BTreeSet<String> {
        self.iter()
            .filter(|e| e.attached)
            .map(|e| e.topic.clone())
            .collect()
    }

    /// Iterates entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Returns summaries of every entry in registration order.
    #[must_use]
    pub fn infos(&self) -> Vec<SubscriptionInfo> {
        self.iter().map(SubscriptionEntry::info).collect()
    }

    /// Returns the number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::domain::DataUpdate;

    fn noop() -> MessageCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn empty_registry() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.attached_topics().is_empty());
    }

    #[test]
    fn same_topic_gets_independent_entries() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.subscribe("/topic/prices", noop(), SubscribeOptions::default());
        let b = registry.subscribe("/topic/prices", noop(), SubscribeOptions::default());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.unsubscribe(&a).is_some());
        assert!(registry.get(&a).is_none());
        assert!(registry.get(&b).is_some());
    }

    #[test]
    fn attach_all_replays_in_registration_order() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.subscribe("/topic/a", noop(), SubscribeOptions::default());
        let second = registry.subscribe("/topic/b", noop(), SubscribeOptions::default());
        let ids: Vec<SubscriptionId> = registry.attach_all().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(
            registry.attached_topics(),
            BTreeSet::from(["/topic/a".to_string(), "/topic/b".to_string()])
        );
    }

    #[test]
    fn detach_all_keeps_entries() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.subscribe("/topic/a", noop(), SubscribeOptions::default());
        registry.attach_all();
        assert_eq!(registry.detach_all(), vec![id]);
        assert_eq!(registry.len(), 1);
        assert!(registry.detach_all().is_empty());
        assert!(registry.attached_topics().is_empty());
    }

    #[test]
    fn filter_decides_acceptance() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.subscribe(
            "/topic/a",
            noop(),
            SubscribeOptions::default().filter(|p| matches!(p, Payload::Update(_))),
        );
        let Some(entry) = registry.get(&id) else {
            panic!("entry missing");
        };
        assert!(entry.accepts(&Payload::Update(DataUpdate::clear())));
        assert!(!entry.accepts(&Payload::Raw("hello".into())));
        assert!(entry.info().filtered);
    }

    #[test]
    fn zero_throttle_means_none() {
        let opts = SubscribeOptions::default().throttle(Duration::ZERO);
        assert!(opts.throttle.is_none());
        let opts = SubscribeOptions::default().throttle(Duration::from_millis(100));
        assert_eq!(opts.throttle, Some(Duration::from_millis(100)));
    }

    #[test]
    fn callback_is_shared_not_copied() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut registry = SubscriptionRegistry::new();
        let id = registry.subscribe(
            "/topic/a",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );
        let Some(entry) = registry.get(&id) else {
            panic!("entry missing");
        };
        let callback = Arc::clone(&entry.callback);
        callback(Delivery {
            subscription_id: id,
            topic: "/topic/a".into(),
            payload: Payload::Raw("x".into()),
            headers: BTreeMap::new(),
            received_at: Utc::now(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
