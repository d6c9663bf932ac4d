//! JSON normalization of decoded CBOR metadata.
//!
//! Detector metadata may key maps with non-string values. JSON cannot, so
//! every keyed container is recursively rewritten with textually formatted
//! keys before serialization. Values survive unchanged; tags collapse to
//! their content; byte strings render as lowercase hex.

use serde_json::{Map, Number, Value};

use crate::codec::{CborValue, MetaMap};

/// Normalize a full metadata mapping into a JSON object.
pub fn normalize_meta(meta: &MetaMap) -> Value {
    let mut out = Map::with_capacity(meta.len());
    for (key, value) in meta {
        out.insert(key.clone(), normalize_value(value));
    }
    Value::Object(out)
}

/// Normalize one decoded CBOR value into JSON.
pub fn normalize_value(value: &CborValue) -> Value {
    match value {
        CborValue::Null => Value::Null,
        CborValue::Bool(b) => Value::Bool(*b),
        CborValue::Unsigned(n) => Value::Number(Number::from(*n)),
        CborValue::Signed(n) => Value::Number(Number::from(*n)),
        CborValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        CborValue::Text(s) => Value::String(s.clone()),
        CborValue::Bytes(b) => Value::String(hex_string(b)),
        CborValue::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        CborValue::Map(entries) => {
            let mut out = Map::with_capacity(entries.len());
            for (key, value) in entries {
                out.insert(format_key(key), normalize_value(value));
            }
            Value::Object(out)
        }
        CborValue::Tagged(_, content) => normalize_value(content),
    }
}

/// Textual form of a map key that is not already a string.
fn format_key(key: &CborValue) -> String {
    match key {
        CborValue::Text(s) => s.clone(),
        CborValue::Unsigned(n) => n.to_string(),
        CborValue::Signed(n) => n.to_string(),
        CborValue::Float(f) => f.to_string(),
        CborValue::Bool(b) => b.to_string(),
        CborValue::Null => "null".to_string(),
        CborValue::Bytes(b) => hex_string(b),
        other => normalize_value(other).to_string(),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
