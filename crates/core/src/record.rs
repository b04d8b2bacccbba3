//! Decoded records and pipeline outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A primitive, schema-typed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

/// Structured result of decoding one message.
///
/// Fields are keyed by column name and kept in column order of the schema.
/// Construction goes through the decoder, which guarantees that every
/// required column is present and type-valid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRecord {
    key_column: String,
    fields: BTreeMap<String, FieldValue>,
    order: Vec<String>,
}

impl DecodedRecord {
    pub(crate) fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            fields: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, column: impl Into<String>, value: FieldValue) {
        let column = column.into();
        if self.fields.insert(column.clone(), value).is_none() {
            self.order.push(column);
        }
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    /// Natural key column name.
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Natural key value. Always present on a decoded record.
    pub fn natural_key(&self) -> Option<&FieldValue> {
        self.fields.get(&self.key_column)
    }

    /// Present columns with their values, in schema order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.order
            .iter()
            .filter_map(|c| self.fields.get(c).map(|v| (c.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Result of a store attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceOutcome {
    /// Row written, or already present under the same natural key.
    Committed,
    /// Structurally valid record refused by the database.
    Rejected(String),
    /// Database unreachable, pool exhausted, or the attempt timed out.
    ConnectionUnavailable,
}

impl PersistenceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Rejected(_) => "rejected",
            Self::ConnectionUnavailable => "connection_unavailable",
        }
    }
}

/// Result of a dead-letter publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed,
    RouteFailed,
}
