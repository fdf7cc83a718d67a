//! Keyed row set materialized from a stream of [`DataUpdate`]s.
//!
//! [`RowSet`] holds rows in arrival order with at most one row per key.
//! [`DataSetReconciler`] wraps a `RowSet` with throughput statistics. The
//! application rules are a pure function of the current rows and the update,
//! so the state after a sequence of updates equals the left fold of that
//! sequence over an empty set (see [`fold`]).
//!
//! Updates that target a key that is not present are dropped, not inserted.
//! The outcome of every application reports how many entries were dropped so
//! callers can tell.
//!
//! A patch may rewrite the key field. The patched row keeps its position and
//! takes the new key; a different row already holding that key is removed.
//! A patch that sets the key field to a value that cannot serve as a key
//! (null, array, object) leaves the key field unchanged.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{Change, DataUpdate, Row};

/// Default key field.
pub const DEFAULT_KEY_FIELD: &str = "id";

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Returns the key of `row` under `key_field`.
///
/// Strings are borrowed as-is; numbers and booleans use their JSON text, so
/// a row with `"id": 42` is addressed by the key `"42"`.
#[must_use]
pub fn row_key<'a>(row: &'a Row, key_field: &str) -> Option<Cow<'a, str>> {
    key_text(row.get(key_field)?)
}

fn key_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

/// Result of applying one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows added, replaced, patched or removed.
    pub changed: usize,
    /// Entries ignored because their key was not found.
    pub dropped: usize,
}

/// Ordered rows with at most one row per key.
///
/// Rows live in a `Vec` for ordering; `index` maps each key to its position.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    key_field: String,
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl RowSet {
    /// Creates an empty set keyed by `key_field`.
    #[must_use]
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Returns the key field.
    #[must_use]
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Returns the rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Returns the row with `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Row> {
        self.position(key).and_then(|pos| self.rows.get(pos))
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Applies one update.
    pub fn apply(&mut self, update: &DataUpdate) -> ApplyOutcome {
        match &update.change {
            Change::Snapshot(rows) => {
                self.clear();
                self.rows.reserve(rows.len());
                for row in rows {
                    self.upsert(row.clone());
                }
                ApplyOutcome {
                    changed: self.rows.len(),
                    dropped: 0,
                }
            }
            Change::Insert(row) => {
                self.upsert(row.clone());
                ApplyOutcome {
                    changed: 1,
                    dropped: 0,
                }
            }
            Change::Update { key, patch } => self.patch(key, patch),
            Change::BatchUpdate(rows) => {
                let mut outcome = ApplyOutcome::default();
                for patch in rows {
                    let step = match row_key(patch, &self.key_field) {
                        Some(key) => self.patch(&key, patch),
                        None => ApplyOutcome {
                            changed: 0,
                            dropped: 1,
                        },
                    };
                    outcome.changed += step.changed;
                    outcome.dropped += step.dropped;
                }
                outcome
            }
            Change::Delete { key } => match self.position(key) {
                Some(pos) => {
                    self.remove_at(pos);
                    ApplyOutcome {
                        changed: 1,
                        dropped: 0,
                    }
                }
                None => ApplyOutcome::default(),
            },
            Change::Clear => {
                let changed = self.rows.len();
                self.clear();
                ApplyOutcome {
                    changed,
                    dropped: 0,
                }
            }
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    /// Appends `row`, or replaces the row with the same key in place.
    fn upsert(&mut self, row: Row) {
        let Some(key) = row_key(&row, &self.key_field).map(Cow::into_owned) else {
            self.rows.push(row);
            return;
        };
        if let Some(slot) = self.index.get(&key).and_then(|&pos| self.rows.get_mut(pos)) {
            *slot = row;
            return;
        }
        self.index.insert(key, self.rows.len());
        self.rows.push(row);
    }

    /// Removes the row at `pos` and shifts the positions of the rows after it.
    fn remove_at(&mut self, pos: usize) {
        if pos >= self.rows.len() {
            return;
        }
        let removed = self.rows.remove(pos);
        if let Some(key) = row_key(&removed, &self.key_field) {
            self.index.remove(key.as_ref());
        }
        for (at, row) in self.rows.iter().enumerate().skip(pos) {
            if let Some(key) = row_key(row, &self.key_field)
                && let Some(slot) = self.index.get_mut(key.as_ref())
            {
                *slot = at;
            }
        }
    }

    fn patch(&mut self, key: &str, patch: &Row) -> ApplyOutcome {
        let Some(mut pos) = self.position(key) else {
            tracing::debug!(key, key_field = %self.key_field, "update for unknown key dropped");
            return ApplyOutcome {
                changed: 0,
                dropped: 1,
            };
        };

        let (rekey, keep_key) = match patch.get(&self.key_field).map(key_text) {
            Some(Some(new_key)) if new_key != key => (Some(new_key.into_owned()), false),
            Some(None) => (None, true),
            Some(Some(_)) | None => (None, false),
        };

        let mut changed = 1;
        if let Some(new_key) = &rekey
            && let Some(other) = self.position(new_key)
        {
            tracing::debug!(key, new_key = %new_key, "re-keyed row replaces existing row");
            self.remove_at(other);
            changed += 1;
            if other < pos {
                pos -= 1;
            }
        }

        let Some(row) = self.rows.get_mut(pos) else {
            return ApplyOutcome::default();
        };
        for (field, value) in patch {
            if keep_key && *field == self.key_field {
                continue;
            }
            row.insert(field.clone(), value.clone());
        }
        if let Some(new_key) = rekey {
            self.index.remove(key);
            self.index.insert(new_key, pos);
        }
        ApplyOutcome {
            changed,
            dropped: 0,
        }
    }
}

impl Default for RowSet {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FIELD)
    }
}

/// Left fold of `updates` over an empty set keyed by `key_field`.
#[must_use]
pub fn fold<'a>(key_field: &str, updates: impl IntoIterator<Item = &'a DataUpdate>) -> RowSet {
    updates.into_iter().fold(RowSet::new(key_field), |mut set, update| {
        set.apply(update);
        set
    })
}

/// Throughput figures of a [`DataSetReconciler`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSetStatistics {
    /// Updates applied since creation.
    pub total_updates: u64,
    /// Updates applied during the last second.
    pub updates_per_second: usize,
    /// Wall-clock time of the last applied update.
    pub last_update: Option<DateTime<Utc>>,
    /// Current number of rows.
    pub row_count: usize,
}

/// Applies updates onto a [`RowSet`] and tracks throughput.
#[derive(Debug, Clone)]
pub struct DataSetReconciler {
    rows: RowSet,
    total_updates: u64,
    window: VecDeque<Instant>,
    last_update: Option<DateTime<Utc>>,
}

impl DataSetReconciler {
    /// Creates an empty reconciler keyed by `key_field`.
    #[must_use]
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            rows: RowSet::new(key_field),
            total_updates: 0,
            window: VecDeque::new(),
            last_update: None,
        }
    }

    /// Applies `update` now.
    pub fn apply(&mut self, update: &DataUpdate) -> ApplyOutcome {
        self.apply_at(update, Instant::now())
    }

    /// Applies `update`, recording it in the rate window at `now`.
    pub fn apply_at(&mut self, update: &DataUpdate, now: Instant) -> ApplyOutcome {
        let outcome = self.rows.apply(update);
        self.total_updates = self.total_updates.saturating_add(1);
        self.last_update = Some(Utc::now());
        self.window.push_back(now);
        self.prune(now);
        outcome
    }

    /// Returns the current rows.
    #[must_use]
    pub fn row_set(&self) -> &RowSet {
        &self.rows
    }

    /// Returns the current rows as a slice.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        self.rows.rows()
    }

    /// Returns statistics as of now.
    #[must_use]
    pub fn statistics(&self) -> DataSetStatistics {
        self.statistics_at(Instant::now())
    }

    /// Returns statistics as of `now`.
    #[must_use]
    pub fn statistics_at(&self, now: Instant) -> DataSetStatistics {
        let recent = self
            .window
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < RATE_WINDOW)
            .count();
        DataSetStatistics {
            total_updates: self.total_updates,
            updates_per_second: recent,
            last_update: self.last_update,
            row_count: self.rows.len(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(*oldest) < RATE_WINDOW {
                break;
            }
            self.window.pop_front();
        }
    }
}

impl Default for DataSetReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FIELD)
    }
}
