//! Deep-merge semantics for `merge` writes.
//!
//! - A top-level `null` patch clears the whole value.
//! - Objects merge key by key, recursively.
//! - A leaf equal to the undefined marker removes that key.
//! - Arrays and scalars replace; arrays never merge element-wise.

use serde_json::{Map, Value};

/// Key of the marker object that stands for an `undefined` leaf.
pub const UNDEFINED_KEY: &str = "$undefined";

/// The marker value for an `undefined` leaf: `{"$undefined": true}`.
pub fn undefined() -> Value {
    let mut map = Map::new();
    map.insert(UNDEFINED_KEY.to_string(), Value::Bool(true));
    Value::Object(map)
}

/// Whether a value is the undefined marker.
pub fn is_undefined(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get(UNDEFINED_KEY) == Some(&Value::Bool(true)),
        _ => false,
    }
}

/// Merge `patch` into `base` and return the result.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    if patch.is_null() {
        return Value::Null;
    }
    merge_value(base, patch)
}

fn merge_value(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) if !is_undefined(patch) => {
            let mut out = base_map.clone();
            for (key, patch_val) in patch_map {
                if is_undefined(patch_val) {
                    out.remove(key);
                    continue;
                }
                let merged = match out.get(key) {
                    Some(existing) => merge_value(existing, patch_val),
                    None => strip_undefined(patch_val),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, patch) => strip_undefined(patch),
    }
}

/// Remove undefined markers from a value that is being inserted wholesale.
fn strip_undefined(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !is_undefined(v))
                .map(|(k, v)| (k.clone(), strip_undefined(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
