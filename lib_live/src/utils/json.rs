use serde_json::{Map, Value};

/// Renders a JSON value with object keys sorted at every depth.
///
/// Two values that are semantically equal render to the same string regardless
/// of the order their fields were inserted in, so the output is safe to feed
/// into a MAC.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Shallow merge: keys of `overlay` replace keys of `base`.
///
/// Non-object inputs are treated as empty objects, so the result is always an object.
pub fn merge_objects(base: &Value, overlay: &Value) -> Value {
    let mut merged: Map<String, Value> = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(extra) = overlay {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Serialized size of a value in bytes, used as the memory estimate for component state.
pub fn estimate_json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
