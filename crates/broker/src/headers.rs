//! Conversion between AMQP field tables and message headers.
//!
//! Only scalar header values survive the conversion. Nested tables, arrays
//! and byte arrays are dropped since nothing in the pipeline reads them.

use engine_core::{HeaderValue, MessageHeaders};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

/// Reads the headers of a delivery.
pub fn from_field_table(table: Option<&FieldTable>) -> MessageHeaders {
    let mut headers = MessageHeaders::new();
    let Some(table) = table else {
        return headers;
    };

    for (name, value) in table.inner() {
        if let Some(value) = header_value(value) {
            headers.insert(name.as_str().to_string(), value);
        }
    }

    headers
}

/// Builds the field table attached to an outgoing publish.
pub fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        let amqp = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Text(s) => AMQPValue::LongString(LongString::from(s.clone())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(name.clone()), amqp);
    }
    table
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
        AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        _ => return None,
    };
    Some(converted)
}
