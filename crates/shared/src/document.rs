use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Reserved metadata field holding the document id.
pub const FIELD_ID: &str = "_id";
/// Reserved metadata field holding the insert timestamp.
pub const FIELD_CREATED: &str = "_createdTimestamp";
/// Reserved metadata field holding the last update timestamp.
pub const FIELD_MODIFIED: &str = "_modifiedTimestamp";
/// Reserved name of the synthetic catch-all search field.
pub const FIELD_FULL_TEXT: &str = "_full_text";

/// 100-nanosecond ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("a document must be a JSON object, got: {0}")]
    NotAnObject(String),
    #[error("the {0} field holds a {1} instead of the expected type")]
    UnexpectedFieldType(String, String),
}

/// A dynamically typed value. Everything a document can hold is one of
/// these variants; all numeric widths normalize to `f64`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Guid(Uuid),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Converts a JSON value, detecting GUID and RFC 3339 timestamp strings.
    /// The detection is idempotent with respect to [`Value::to_json`].
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(*value),
            serde_json::Value::Number(value) => {
                Value::Number(value.as_f64().unwrap_or(f64::NAN))
            }
            serde_json::Value::String(value) => Self::from_text(value),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Classifies a string as a GUID, a timestamp, or plain text.
    pub fn from_text(text: &str) -> Value {
        if let Some(guid) = parse_guid(text) {
            return Value::Guid(guid);
        }
        if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
            return Value::Timestamp(instant.with_timezone(&Utc));
        }
        Value::Text(text.to_string())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => serde_json::Value::Bool(*value),
            Value::Number(value) => number_to_json(*value),
            Value::Text(value) => serde_json::Value::String(value.clone()),
            Value::Timestamp(value) => serde_json::Value::String(
                value.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Value::Guid(value) => serde_json::Value::String(value.to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Value::Guid(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Guid(_) => "guid",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

/// Only the canonical hyphenated form is treated as a GUID. Accepting the
/// other `uuid` input formats would reclassify ordinary 32-character hex
/// strings on round-trip.
fn parse_guid(text: &str) -> Option<Uuid> {
    let bytes = text.as_bytes();
    if bytes.len() != 36
        || bytes[8] != b'-'
        || bytes[13] != b'-'
        || bytes[18] != b'-'
        || bytes[23] != b'-'
    {
        return None;
    }
    Uuid::try_parse(text).ok()
}

/// Renders an `f64` in its canonical, locale-invariant form. Integral
/// values within the exact-integer range print without a fraction part.
pub fn canonical_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// The JSON form of an `f64`: integral values in the exact-integer range
/// become JSON integers, everything else a JSON float.
pub fn number_to_json(value: f64) -> serde_json::Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// The tick count of an instant: 100-ns intervals since the Unix epoch.
pub fn timestamp_ticks(instant: &DateTime<Utc>) -> i64 {
    instant.timestamp() * TICKS_PER_SECOND + i64::from(instant.timestamp_subsec_nanos()) / 100
}

/// A keyed map of values with reserved metadata fields. This is the unit
/// of storage and indexing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a document from a JSON object, applying string detection.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, DocumentError> {
        match Value::from_json(json) {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DocumentError::NotAnObject(other.type_name().to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        Value::Object(self.fields.clone()).to_json()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn id(&self) -> Option<Uuid> {
        self.fields.get(FIELD_ID).and_then(Value::as_guid)
    }

    pub fn set_id(&mut self, id: Uuid) {
        self.fields.insert(FIELD_ID.to_string(), Value::Guid(id));
    }

    /// Returns the document id, generating and assigning one when absent.
    pub fn ensure_id(&mut self) -> Uuid {
        match self.id() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                self.set_id(id);
                id
            }
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.fields.get(FIELD_CREATED).and_then(Value::as_timestamp)
    }

    pub fn set_created_at(&mut self, instant: DateTime<Utc>) {
        self.fields
            .insert(FIELD_CREATED.to_string(), Value::Timestamp(instant));
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.fields.get(FIELD_MODIFIED).and_then(Value::as_timestamp)
    }

    pub fn set_modified_at(&mut self, instant: DateTime<Utc>) {
        self.fields
            .insert(FIELD_MODIFIED.to_string(), Value::Timestamp(instant));
    }
}

/// True for `_id`, the timestamp pair, `_full_text`, and the synthetic
/// `__…__` names the index reserves for itself.
pub fn is_reserved_field_name(name: &str) -> bool {
    matches!(name, FIELD_ID | FIELD_CREATED | FIELD_MODIFIED | FIELD_FULL_TEXT)
        || (name.len() > 4 && name.starts_with("__") && name.ends_with("__"))
}

/// True for the three metadata fields present on every stored document.
pub fn is_metadata_field_name(name: &str) -> bool {
    matches!(name, FIELD_ID | FIELD_CREATED | FIELD_MODIFIED)
}
