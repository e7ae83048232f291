use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// A single field scalar carried by a point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Boolean(bool),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Unsigned(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Unsigned(v) => write!(f, "{}u", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// One measurement sample: name, tags, fields, timestamp. Immutable after
/// creation; the accumulator is the only producer.
#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(
        name: impl Into<String>,
        tags: HashMap<String, String>,
        fields: HashMap<String, FieldValue>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            timestamp,
        }
    }

    /// Convert the point to a JSON-compatible format
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "tags": self.tags,
            "fields": self.fields,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// Renders tags and fields in sorted order so debug output is stable
impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;

        let mut tags: Vec<_> = self.tags.iter().collect();
        tags.sort();
        for (key, value) in tags {
            write!(f, ",{}={}", key, value)?;
        }

        let mut fields: Vec<_> = self.fields.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (i, (key, value)) in fields.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{}{}={}", sep, key, value)?;
        }

        write!(f, " {}", self.timestamp.timestamp_nanos_opt().unwrap_or(0))
    }
}
