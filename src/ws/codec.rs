//! Message body codec.
//!
//! Converts `MESSAGE` bodies into [`Payload`]s and publish payloads into
//! `SEND` bodies. The wire shape is
//! `{ type, timestamp, data?, key?, metadata? }`; it is validated here and
//! turned into a [`DataUpdate`], so nothing downstream inspects raw JSON.
//!
//! Bodies that are not JSON at all are passed through as
//! [`Payload::Raw`]. Bodies that are JSON but do not describe a valid update
//! are a [`LinkError::Parse`]: the caller drops that one message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Change, DataUpdate, Payload, Row, UpdateKind};
use crate::error::LinkError;

/// Content type of JSON publish bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of string publish bodies.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// Wire shape of a change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireUpdate {
    #[serde(rename = "type")]
    kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Row>,
}

impl TryFrom<WireUpdate> for DataUpdate {
    type Error = LinkError;

    fn try_from(wire: WireUpdate) -> Result<Self, Self::Error> {
        let metadata = wire.metadata.unwrap_or_default();
        let key = wire.key.and_then(key_string);

        let change = match wire.kind {
            UpdateKind::Snapshot => match wire.data {
                Some(Value::Array(items)) => Change::Snapshot(rows_of(items)?),
                Some(Value::Object(row)) => Change::Snapshot(vec![row]),
                _ => return Err(parse_err("snapshot requires object or array `data`")),
            },
            UpdateKind::Insert => match wire.data {
                Some(Value::Object(row)) => Change::Insert(row),
                _ => return Err(parse_err("insert requires object `data`")),
            },
            UpdateKind::Update => {
                let is_batch = metadata.get("isBatch").and_then(Value::as_bool) == Some(true);
                match (wire.data, key) {
                    (Some(Value::Array(items)), _) if is_batch => {
                        Change::BatchUpdate(rows_of(items)?)
                    }
                    (Some(Value::Array(_)), _) => {
                        return Err(parse_err("array update requires `metadata.isBatch`"));
                    }
                    (Some(Value::Object(patch)), Some(key)) => Change::Update { key, patch },
                    (Some(Value::Object(_)), None) => {
                        return Err(parse_err("update requires `key`"));
                    }
                    _ => return Err(parse_err("update requires object or array `data`")),
                }
            }
            UpdateKind::Delete => match key {
                Some(key) => Change::Delete { key },
                None => return Err(parse_err("delete requires `key`")),
            },
            UpdateKind::Clear => Change::Clear,
        };

        let timestamp = match wire.timestamp {
            Some(Value::String(ts)) => ts,
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Ok(Self {
            timestamp,
            change,
            metadata,
        })
    }
}

impl From<&DataUpdate> for WireUpdate {
    fn from(update: &DataUpdate) -> Self {
        let array = |rows: &[Row]| Value::Array(rows.iter().cloned().map(Value::Object).collect());
        let (data, key) = match &update.change {
            Change::Snapshot(rows) | Change::BatchUpdate(rows) => (Some(array(rows)), None),
            Change::Insert(row) => (Some(Value::Object(row.clone())), None),
            Change::Update { key, patch } => (
                Some(Value::Object(patch.clone())),
                Some(Value::String(key.clone())),
            ),
            Change::Delete { key } => (None, Some(Value::String(key.clone()))),
            Change::Clear => (None, None),
        };
        let mut metadata = update.metadata.clone();
        if update.is_batch() {
            metadata.insert("isBatch".to_string(), Value::Bool(true));
        }
        Self {
            kind: update.kind(),
            timestamp: Some(Value::String(update.timestamp.clone())),
            data,
            key,
            metadata: (!metadata.is_empty()).then_some(metadata),
        }
    }
}

/// Decodes a `MESSAGE` body.
///
/// # Errors
///
/// Returns [`LinkError::Parse`] if the body is JSON but not a valid update.
pub fn decode_body(body: &str) -> Result<Payload, LinkError> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => parse_update(value).map(Payload::Update),
        Err(_) => Ok(Payload::Raw(body.to_string())),
    }
}

/// Validates a wire JSON value as a [`DataUpdate`].
///
/// # Errors
///
/// Returns [`LinkError::Parse`] when the `type` is missing or unknown, or
/// when a field (`data`, `key`, `metadata`) is missing or has the wrong shape.
pub fn parse_update(value: Value) -> Result<DataUpdate, LinkError> {
    let wire: WireUpdate =
        serde_json::from_value(value).map_err(|err| LinkError::Parse(err.to_string()))?;
    DataUpdate::try_from(wire)
}

/// Encodes a [`DataUpdate`] in its wire shape.
///
/// # Errors
///
/// Returns [`LinkError::Serialization`] if the update cannot be serialized.
pub fn encode_update(update: &DataUpdate) -> Result<Value, LinkError> {
    Ok(serde_json::to_value(WireUpdate::from(update))?)
}

/// Serializes a publish payload: strings are sent verbatim, everything else
/// as JSON. Returns the body and its content type.
///
/// # Errors
///
/// Returns [`LinkError::Serialization`] if the value cannot be serialized.
pub fn encode_publish(data: &Value) -> Result<(String, &'static str), LinkError> {
    match data {
        Value::String(text) => Ok((text.clone(), TEXT_CONTENT_TYPE)),
        other => Ok((serde_json::to_string(other)?, JSON_CONTENT_TYPE)),
    }
}

fn key_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn rows_of(items: Vec<Value>) -> Result<Vec<Row>, LinkError> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            _ => Err(parse_err("rows must be JSON objects")),
        })
        .collect()
}

fn parse_err(msg: &str) -> LinkError {
    LinkError::Parse(msg.to_string())
}
