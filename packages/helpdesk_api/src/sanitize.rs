//! Error-body sanitization.
//!
//! Error responses can echo request payloads, tokens or internal traces. Only
//! a recognized `{error, message, errors}` shape is kept; anything else is
//! replaced by a placeholder.

use serde_json::{Map, Value};

const KEPT_FIELDS: [&str; 3] = ["error", "message", "errors"];

pub const OMITTED: &str = "(error body omitted)";

pub fn sanitize_error_body(body: &[u8]) -> String {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) else {
        return OMITTED.to_string();
    };

    let kept: Map<String, Value> = object
        .into_iter()
        .filter(|(key, value)| KEPT_FIELDS.contains(&key.as_str()) && is_plain(value))
        .collect();

    if kept.is_empty() {
        return OMITTED.to_string();
    }
    Value::Object(kept).to_string()
}

/// Strings, or arrays/objects whose leaves are strings (validation errors
/// come as `["msg"]` or `{"field": ["msg"]}`).
fn is_plain(value: &Value) -> bool {
    match value {
        Value::String(_) => true,
        Value::Array(items) => items.iter().all(is_plain),
        Value::Object(fields) => fields.values().all(is_plain),
        _ => false,
    }
}
