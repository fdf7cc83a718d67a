//! A subscription materialized into a live keyed row set.
//!
//! [`LiveDataSet`] pairs a subscription with a [`DataSetReconciler`]. The
//! subscription callback applies every change event to the reconciler and
//! bumps a version counter on a `watch` channel, so consumers can read the
//! rows at any time and await the next change.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::domain::{
    DataSetReconciler, DataSetStatistics, Delivery, Payload, Row, SubscriptionId,
};
use crate::ws::MessageCallback;

/// Rows of one topic, kept current by its subscription.
#[derive(Debug, Clone)]
pub struct LiveDataSet {
    connection_id: String,
    topic: String,
    subscription_id: SubscriptionId,
    reconciler: Arc<Mutex<DataSetReconciler>>,
    version: watch::Receiver<u64>,
}

/// Write side of a [`LiveDataSet`], turned into the subscription callback.
#[derive(Debug)]
pub(crate) struct DataSetSink {
    reconciler: Arc<Mutex<DataSetReconciler>>,
    version: Arc<watch::Sender<u64>>,
}

impl DataSetSink {
    pub(crate) fn new(key_field: &str) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            reconciler: Arc::new(Mutex::new(DataSetReconciler::new(key_field))),
            version: Arc::new(version),
        }
    }

    /// Builds the read side once the subscription id is known.
    pub(crate) fn dataset(
        &self,
        connection_id: &str,
        topic: &str,
        subscription_id: SubscriptionId,
    ) -> LiveDataSet {
        LiveDataSet {
            connection_id: connection_id.to_string(),
            topic: topic.to_string(),
            subscription_id,
            reconciler: Arc::clone(&self.reconciler),
            version: self.version.subscribe(),
        }
    }

    /// Returns the subscription callback feeding this sink.
    pub(crate) fn callback(&self) -> MessageCallback {
        let reconciler = Arc::clone(&self.reconciler);
        let version = Arc::clone(&self.version);
        Arc::new(move |delivery: Delivery| {
            let Payload::Update(update) = &delivery.payload else {
                tracing::debug!(topic = %delivery.topic, "ignoring raw message on dataset topic");
                return;
            };
            let outcome = lock(&reconciler).apply(update);
            if outcome.dropped > 0 {
                tracing::debug!(
                    topic = %delivery.topic,
                    kind = update.kind().as_str(),
                    dropped = outcome.dropped,
                    "update targeted missing rows"
                );
            }
            version.send_modify(|v| *v = v.wrapping_add(1));
        })
    }
}

impl LiveDataSet {
    /// Returns the owning connection id.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Returns the mirrored topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the feeding subscription.
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Returns a copy of the current rows.
    #[must_use]
    pub fn rows(&self) -> Vec<Row> {
        lock(&self.reconciler).rows().to_vec()
    }

    /// Returns a copy of the row with `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Row> {
        lock(&self.reconciler).row_set().get(key).cloned()
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.reconciler).row_set().len()
    }

    /// Returns `true` if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns throughput statistics.
    #[must_use]
    pub fn statistics(&self) -> DataSetStatistics {
        lock(&self.reconciler).statistics()
    }

    /// Returns the number of updates applied so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Returns a receiver that changes after every applied update.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.clone()
    }
}

/// Locks the reconciler. A panicking subscriber cannot leave the rows
/// half-applied, so a poisoned lock is still usable.
fn lock(reconciler: &Mutex<DataSetReconciler>) -> MutexGuard<'_, DataSetReconciler> {
    reconciler.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use serde_json::{Value, json};

    use super::*;
    use crate::ws::codec;

    fn deliver(callback: &MessageCallback, id: SubscriptionId, body: &str) {
        let Ok(payload) = codec::decode_body(body) else {
            panic!("bad body {body}");
        };
        callback(Delivery {
            subscription_id: id,
            topic: "/topic/prices".into(),
            payload,
            headers: BTreeMap::new(),
            received_at: Utc::now(),
        });
    }

    #[test]
    fn applies_updates_and_bumps_version() {
        let sink = DataSetSink::new("id");
        let id = SubscriptionId::new();
        let dataset = sink.dataset("c1", "/topic/prices", id);
        let callback = sink.callback();

        deliver(&callback, id, r#"{"type":"snapshot","data":[{"id":"A","price":1}]}"#);
        deliver(&callback, id, r#"{"type":"update","key":"A","data":{"price":2}}"#);
        deliver(&callback, id, "heartbeat text");

        assert_eq!(dataset.version(), 2);
        assert_eq!(dataset.len(), 1);
        let Some(row) = dataset.get("A") else {
            panic!("row A missing");
        };
        assert_eq!(row.get("price"), Some(&json!(2)));
        assert_eq!(dataset.statistics().total_updates, 2);
        assert_eq!(dataset.topic(), "/topic/prices");
        assert_eq!(dataset.subscription_id(), id);
    }

    #[test]
    fn clones_share_rows() {
        let sink = DataSetSink::new("id");
        let id = SubscriptionId::new();
        let a = sink.dataset("c1", "/topic/prices", id);
        let b = a.clone();
        deliver(&sink.callback(), id, r#"{"type":"insert","data":{"id":"X"}}"#);
        assert_eq!(b.rows(), a.rows());
        assert_eq!(
            a.rows().first().and_then(|r| r.get("id")),
            Some(&Value::String("X".into()))
        );
    }

    #[tokio::test]
    async fn changes_notify_waiters() {
        let sink = DataSetSink::new("id");
        let id = SubscriptionId::new();
        let dataset = sink.dataset("c1", "/topic/prices", id);
        let mut changes = dataset.changes();
        let callback = sink.callback();

        let waiter = tokio::spawn(async move { changes.changed().await.is_ok() });
        tokio::task::yield_now().await;
        deliver(&callback, id, r#"{"type":"clear"}"#);
        assert!(matches!(waiter.await, Ok(true)));
    }
}
