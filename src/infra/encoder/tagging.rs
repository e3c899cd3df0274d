//! Union type tagging
//!
//! Every descendant value is wrapped in a single-key object naming its
//! type, so consumers can decode the payload against a union schema:
//!
//! | JSON value | tagged form |
//! |---|---|
//! | `true` | `{"boolean": true}` |
//! | `1.5` | `{"double": 1.5}` |
//! | `"x"` | `{"string": "x"}` |
//! | `null` | `null` |
//! | `[..]` | `{"array": [..]}` |
//! | `{..}` | `{"map": {..}}` |
//!
//! Keys starting with `__` are internal bookkeeping and never published.

use serde_json::{Map, Value};

/// Prefix of keys stripped before tagging
pub const RESERVED_PREFIX: &str = "__";

/// Tag a payload whose top-level shape is fixed by the schema.
///
/// A top-level object or array keeps its shape and only its descendants
/// are tagged. A top-level scalar is tagged like any other value.
pub fn tag_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(tag_entries(map)),
        Value::Array(items) => Value::Array(items.iter().map(tag_value).collect()),
        scalar => tag_value(scalar),
    }
}

/// Tag a single value and everything below it.
pub fn tag_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => tagged("boolean", Value::Bool(*b)),
        Value::Number(n) => tagged("double", Value::Number(n.clone())),
        Value::String(s) => tagged("string", Value::String(s.clone())),
        Value::Array(items) => tagged("array", Value::Array(items.iter().map(tag_value).collect())),
        Value::Object(map) => tagged("map", Value::Object(tag_entries(map))),
    }
}

fn tag_entries(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX))
        .map(|(key, value)| (key.clone(), tag_value(value)))
        .collect()
}

fn tagged(tag: &str, value: Value) -> Value {
    let mut wrapper = Map::with_capacity(1);
    wrapper.insert(tag.to_string(), value);
    Value::Object(wrapper)
}
