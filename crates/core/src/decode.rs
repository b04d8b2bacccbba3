//! Message decoding against the target table schema.
//!
//! Decoding is a pure function of the payload bytes. Every failure is
//! terminal for the message: a payload that does not decode now will not
//! decode on redelivery either.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::{DecodedRecord, FieldValue};
use crate::schema::{ColumnSpec, EpochUnit, FieldKind, TableSchema};

/// Maximum accepted payload size in bytes (256KB).
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Why a payload could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("payload {size} bytes exceeds {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("field `{field}` expected {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// Decodes raw payloads into [`DecodedRecord`]s for one table schema.
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    schema: TableSchema,
}

impl MessageDecoder {
    pub fn new(schema: TableSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Validates and deserializes a payload.
    ///
    /// Unknown fields are ignored, `null` counts as absent, and optional
    /// columns that are absent are left out of the record.
    pub fn decode(&self, raw: &[u8]) -> Result<DecodedRecord, DecodeError> {
        if raw.len() > MAX_PAYLOAD_BYTES {
            return Err(DecodeError::TooLarge {
                size: raw.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let value: Value =
            serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let object = match value {
            Value::Object(map) => map,
            other => return Err(DecodeError::NotAnObject(json_type(&other))),
        };

        let mut record = DecodedRecord::new(self.schema.key_column.clone());

        for column in &self.schema.columns {
            match lookup(&object, column) {
                Some(raw_value) => {
                    let value = coerce(column, raw_value)?;
                    if column.name == self.schema.key_column && is_blank(&value) {
                        return Err(DecodeError::MissingField(column.field().to_string()));
                    }
                    record.insert(column.name.clone(), value);
                }
                None if column.required => {
                    return Err(DecodeError::MissingField(column.field().to_string()));
                }
                None => {}
            }
        }

        Ok(record)
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, column: &ColumnSpec) -> Option<&'a Value> {
    object.get(column.field()).filter(|v| !v.is_null())
}

fn is_blank(value: &FieldValue) -> bool {
    matches!(value, FieldValue::Text(s) if s.trim().is_empty())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(field: &str, kind: FieldKind, value: &Value) -> DecodeError {
    DecodeError::TypeMismatch {
        field: field.to_string(),
        expected: kind.name(),
        found: match value {
            Value::String(s) => format!("string {:?}", s),
            Value::Number(n) => format!("number {}", n),
            other => json_type(other).to_string(),
        },
    }
}

/// Coerces a JSON value to the column's declared kind.
fn coerce(column: &ColumnSpec, value: &Value) -> Result<FieldValue, DecodeError> {
    let coerced = match (column.kind, value) {
        (FieldKind::Text, Value::String(s)) => Some(FieldValue::Text(s.clone())),

        (FieldKind::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64))
            .map(FieldValue::Integer),
        (FieldKind::Integer, Value::String(s)) => s.trim().parse().ok().map(FieldValue::Integer),

        (FieldKind::Float, Value::Number(n)) => n.as_f64().map(FieldValue::Float),
        (FieldKind::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float),

        (FieldKind::Boolean, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
        (FieldKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(FieldValue::Boolean(true)),
            "false" => Some(FieldValue::Boolean(false)),
            _ => None,
        },

        (FieldKind::Timestamp, Value::String(s)) => parse_timestamp(s).map(FieldValue::Timestamp),
        (FieldKind::Timestamp, Value::Number(n)) => {
            epoch_timestamp(n, column.epoch_unit).map(FieldValue::Timestamp)
        }

        _ => None,
    };

    coerced.ok_or_else(|| mismatch(column.field(), column.kind, value))
}

fn epoch_timestamp(n: &serde_json::Number, unit: EpochUnit) -> Option<DateTime<Utc>> {
    match unit {
        EpochUnit::Seconds => match n.as_i64() {
            Some(secs) => DateTime::from_timestamp(secs, 0),
            None => n
                .as_f64()
                .filter(|f| f.is_finite())
                .and_then(|f| DateTime::from_timestamp_millis((f * 1000.0).round() as i64)),
        },
        EpochUnit::Millis => n.as_i64().and_then(DateTime::from_timestamp_millis),
    }
}

/// Parses RFC 3339 (including a trailing `Z`) or a naive ISO 8601 time as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
