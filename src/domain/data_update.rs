//! Canonical change events delivered to subscribers.
//!
//! The wire format is loosely typed (`data` may be a row or an array, batch
//! updates are flagged through `metadata.isBatch`). [`DataUpdate`] is the
//! closed form produced by [`crate::ws::codec`]: once a body has been parsed
//! into a [`Change`], downstream code never has to re-check shapes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single row: a JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Wire discriminator of a [`DataUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Full replacement of the row set.
    Snapshot,
    /// One new row.
    Insert,
    /// Partial update of one or more existing rows.
    Update,
    /// Removal of one row.
    Delete,
    /// Removal of every row.
    Clear,
}

impl UpdateKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Clear => "clear",
        }
    }
}

/// Validated payload of a [`DataUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Replace the whole row set.
    Snapshot(Vec<Row>),
    /// Append a row.
    Insert(Row),
    /// Shallow-merge `patch` into the row identified by `key`.
    Update {
        /// Key of the row to patch.
        key: String,
        /// Fields to overwrite.
        patch: Row,
    },
    /// Shallow-merge each element into the row identified by its own key.
    BatchUpdate(Vec<Row>),
    /// Remove the row identified by `key`.
    Delete {
        /// Key of the row to remove.
        key: String,
    },
    /// Remove every row.
    Clear,
}

/// A change event with its envelope fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DataUpdate {
    /// Producer timestamp, carried verbatim from the wire.
    pub timestamp: String,
    /// The validated change.
    pub change: Change,
    /// Free-form producer metadata.
    pub metadata: Row,
}

impl DataUpdate {
    /// Wraps `change` with the current time and empty metadata.
    #[must_use]
    pub fn new(change: Change) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            change,
            metadata: Row::new(),
        }
    }

    /// Builds a snapshot update.
    #[must_use]
    pub fn snapshot(rows: Vec<Row>) -> Self {
        Self::new(Change::Snapshot(rows))
    }

    /// Builds an insert update.
    #[must_use]
    pub fn insert(row: Row) -> Self {
        Self::new(Change::Insert(row))
    }

    /// Builds a single-row update.
    #[must_use]
    pub fn update(key: impl Into<String>, patch: Row) -> Self {
        Self::new(Change::Update {
            key: key.into(),
            patch,
        })
    }

    /// Builds a batched update; each row carries its own key.
    #[must_use]
    pub fn batch_update(rows: Vec<Row>) -> Self {
        let mut update = Self::new(Change::BatchUpdate(rows));
        update.metadata.insert("isBatch".to_string(), Value::Bool(true));
        update
    }

    /// Builds a delete update.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(Change::Delete { key: key.into() })
    }

    /// Builds a clear update.
    #[must_use]
    pub fn clear() -> Self {
        Self::new(Change::Clear)
    }

    /// Returns the wire discriminator.
    #[must_use]
    pub const fn kind(&self) -> UpdateKind {
        match self.change {
            Change::Snapshot(_) => UpdateKind::Snapshot,
            Change::Insert(_) => UpdateKind::Insert,
            Change::Update { .. } | Change::BatchUpdate(_) => UpdateKind::Update,
            Change::Delete { .. } => UpdateKind::Delete,
            Change::Clear => UpdateKind::Clear,
        }
    }

    /// Returns the row key for single-row updates and deletes.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match &self.change {
            Change::Update { key, .. } | Change::Delete { key } => Some(key.as_str()),
            _ => None,
        }
    }

    /// Returns `true` for batched updates.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        matches!(self.change, Change::BatchUpdate(_))
    }
}

/// Builds a [`Row`] from a JSON value, returning `None` for non-objects.
#[must_use]
pub fn row_from_value(value: Value) -> Option<Row> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        let Some(row) = row_from_value(value) else {
            panic!("expected object");
        };
        row
    }

    #[test]
    fn kind_maps_batch_update_to_update() {
        let update = DataUpdate::batch_update(vec![row(json!({"id": "A", "price": 1}))]);
        assert_eq!(update.kind(), UpdateKind::Update);
        assert!(update.is_batch());
        assert_eq!(update.metadata.get("isBatch"), Some(&Value::Bool(true)));
    }

    #[test]
    fn key_only_for_keyed_changes() {
        assert_eq!(DataUpdate::delete("A").key(), Some("A"));
        assert_eq!(DataUpdate::update("B", Row::new()).key(), Some("B"));
        assert_eq!(DataUpdate::clear().key(), None);
        assert_eq!(DataUpdate::insert(row(json!({"id": "C"}))).key(), None);
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(UpdateKind::Snapshot.as_str(), "snapshot");
        assert_eq!(DataUpdate::clear().kind().as_str(), "clear");
        let json = serde_json::to_string(&UpdateKind::Delete).unwrap_or_default();
        assert_eq!(json, "\"delete\"");
    }

    #[test]
    fn row_from_value_rejects_scalars() {
        assert!(row_from_value(json!(42)).is_none());
        assert!(row_from_value(json!([{"id": 1}])).is_none());
    }
}
