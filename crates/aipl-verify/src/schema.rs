//! Minimal JSON-schema validation for `json_schema` checks, plus the deep
//! containment test used by HTTP checks.
//!
//! Only the recognized keywords are enforced: `type` over
//! {object, array, string, integer, number, boolean, null}, `required`,
//! `properties`, `items`, `enum`, and `anyOf`/`oneOf`/`allOf`. Anything else
//! is ignored.

use serde_json::Value;

pub const MAX_SCHEMA_DEPTH: usize = 20;
pub const MAX_SCHEMA_ITEMS: usize = 100;

/// Structural nesting depth of a schema value.
pub fn schema_depth(schema: &Value) -> usize {
    fn depth_at(value: &Value, depth: usize) -> usize {
        if depth > MAX_SCHEMA_DEPTH {
            return depth;
        }
        match value {
            Value::Object(map) => map
                .values()
                .map(|v| depth_at(v, depth + 1))
                .max()
                .unwrap_or(depth),
            Value::Array(items) => items
                .iter()
                .map(|v| depth_at(v, depth + 1))
                .max()
                .unwrap_or(depth),
            _ => depth,
        }
    }
    depth_at(schema, 0)
}

/// Validate `data` against `schema`. Returns the first violation as a path
/// annotated message.
pub fn validate_schema(data: &Value, schema: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    for keyword in ["allOf", "anyOf", "oneOf"] {
        let Some(variants) = schema_obj.get(keyword).and_then(Value::as_array) else {
            continue;
        };
        let matches = variants
            .iter()
            .filter(|variant| validate_schema(data, variant).is_ok())
            .count();
        let ok = match keyword {
            "allOf" => matches == variants.len(),
            "anyOf" => matches >= 1,
            _ => matches == 1,
        };
        if !ok {
            return Err(format!("{keyword} not satisfied"));
        }
    }

    if let Some(kind) = schema_obj.get("type").and_then(Value::as_str) {
        match kind {
            "object" => {
                let Some(map) = data.as_object() else {
                    return Err("expected object".to_string());
                };
                if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
                    for key in required.iter().filter_map(Value::as_str) {
                        if !map.contains_key(key) {
                            return Err(format!("missing required key: {key}"));
                        }
                    }
                }
                if let Some(props) = schema_obj.get("properties").and_then(Value::as_object) {
                    for (key, subschema) in props {
                        if let Some(value) = map.get(key) {
                            validate_schema(value, subschema)
                                .map_err(|err| format!("key {key}: {err}"))?;
                        }
                    }
                }
            }
            "array" => {
                let Some(items) = data.as_array() else {
                    return Err("expected array".to_string());
                };
                if let Some(item_schema) = schema_obj.get("items") {
                    if item_schema.is_object() {
                        for (idx, item) in items.iter().take(MAX_SCHEMA_ITEMS).enumerate() {
                            validate_schema(item, item_schema)
                                .map_err(|err| format!("item {idx}: {err}"))?;
                        }
                    }
                }
            }
            "string" => {
                if !data.is_string() {
                    return Err("expected string".to_string());
                }
            }
            "integer" => {
                if !(data.is_i64() || data.is_u64()) {
                    return Err("expected integer".to_string());
                }
            }
            "number" => {
                if !data.is_number() {
                    return Err("expected number".to_string());
                }
            }
            "boolean" => {
                if !data.is_boolean() {
                    return Err("expected boolean".to_string());
                }
            }
            "null" => {
                if !data.is_null() {
                    return Err("expected null".to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(variants) = schema_obj.get("enum").and_then(Value::as_array) {
        if !variants.contains(data) {
            return Err("expected enum value".to_string());
        }
    }

    Ok(())
}

/// Deep containment: objects require every expected key to be present and
/// match; arrays match as a prefix subset; scalars by equality.
pub fn json_contains(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Object(expected_map) => {
            let Some(actual_map) = actual.as_object() else {
                return false;
            };
            expected_map.iter().all(|(key, value)| {
                actual_map
                    .get(key)
                    .is_some_and(|actual_value| json_contains(actual_value, value))
            })
        }
        Value::Array(expected_items) => {
            let Some(actual_items) = actual.as_array() else {
                return false;
            };
            if expected_items.len() > actual_items.len() {
                return false;
            }
            expected_items
                .iter()
                .zip(actual_items)
                .all(|(expected_item, actual_item)| json_contains(actual_item, expected_item))
        }
        _ => actual == expected,
    }
}
