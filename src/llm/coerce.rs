//! Tool-argument normalization.
//!
//! Some backends send booleans as the strings "true"/"false". Arguments are
//! coerced recursively before they reach any caller; numeric strings are
//! left alone.

use serde_json::{Map, Value};
use tracing::warn;

pub fn coerce_value(value: Value) -> Value {
    match value {
        Value::String(s) => {
            if s.eq_ignore_ascii_case("true") {
                Value::Bool(true)
            } else if s.eq_ignore_ascii_case("false") {
                Value::Bool(false)
            } else {
                Value::String(s)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(coerce_value).collect()),
        Value::Object(map) => Value::Object(coerce_map(map)),
        other => other,
    }
}

pub fn coerce_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter().map(|(k, v)| (k, coerce_value(v))).collect()
}

/// Normalize an already-decoded arguments value into an object.
///
/// A non-object payload is kept under the `input` key.
pub fn coerce_arguments(value: Value) -> Map<String, Value> {
    match coerce_value(value) {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

/// Decode arguments delivered as a JSON string, then coerce them.
pub fn parse_arguments(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => coerce_arguments(value),
        Err(e) => {
            warn!(error = %e, "tool arguments are not valid JSON, passing raw text");
            coerce_arguments(Value::String(raw.to_string()))
        }
    }
}
