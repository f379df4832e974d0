// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records and their validation.
//!
//! A log record is a JSON object. The server only forwards records that carry every field of
//! [`REQUIRED_FIELDS`] with the expected JSON type, and tags them with the authenticated client's
//! display name.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields every forwarded record must carry.
pub const REQUIRED_FIELDS: [&str; 5] = ["level", "pid", "message", "created_at", "created_by"];

/// Optional fields with a well known meaning.
pub const OPTIONAL_FIELDS: [&str; 4] = ["host", "exception", "path", "lineno"];

/// A structured log record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord(Map<String, Value>);

impl LogRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Converts a decoded frame into a record. Anything but a JSON object yields `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Returns the first required field that is missing or carries the wrong type.
    pub fn missing_field(&self) -> Option<&'static str> {
        REQUIRED_FIELDS.into_iter().find(|field| {
            let Some(value) = self.0.get(*field) else {
                return true;
            };
            match *field {
                "level" | "pid" => !(value.is_i64() || value.is_u64()),
                "created_at" => !(value.is_string() || value.is_number()),
                _ => !value.is_string(),
            }
        })
    }

    pub fn is_valid(&self) -> bool {
        self.missing_field().is_none()
    }

    /// Sets `host` to the client's display name unless the record already names a host.
    pub fn enrich_host(&mut self, display_name: &str) {
        let has_host = matches!(self.0.get("host"), Some(Value::String(host)) if !host.is_empty());
        if !has_host {
            self.0.insert("host".to_string(), Value::String(display_name.to_string()));
        }
    }

    /// Ordering key of the record inside a sink buffer.
    pub fn priority_key(&self) -> PriorityKey {
        PriorityKey::from_value(self.0.get("created_at"))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }
}

impl From<Map<String, Value>> for LogRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Ordering key derived from a record's `created_at`.
///
/// Records without a timestamp sort first, followed by numeric epochs, then textual timestamps.
/// ISO-8601 strings of the same shape sort chronologically when compared lexicographically.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorityKey {
    Missing,
    Number(f64),
    Text(String),
    Other(String),
}

impl PriorityKey {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Missing,
            Some(Value::Number(n)) => n.as_f64().map_or(Self::Missing, Self::Number),
            Some(Value::String(s)) => Self::Text(s.clone()),
            Some(other) => Self::Other(other.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Missing => 0,
            Self::Number(_) => 1,
            Self::Text(_) => 2,
            Self::Other(_) => 3,
        }
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) | (Self::Other(a), Self::Other(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}
