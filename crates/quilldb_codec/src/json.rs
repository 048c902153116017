//! JSON interop for value trees.
//!
//! Wire message bodies and checkpoint documents are JSON; document bodies
//! are the binary encoding. These conversions bridge the two. Byte strings
//! have no JSON form and come back as base64 text, which is acceptable for
//! the places this is used (none of them carry raw bytes).

use crate::value::Value;
use base64::Engine;
use serde_json::Number;

/// Converts a value tree to JSON.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::Number(Number::from(*n)),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => {
            let mut map = serde_json::Map::with_capacity(pairs.len());
            for (k, v) in pairs {
                let key = match k {
                    Value::Text(s) => s.clone(),
                    other => stringify_key(other),
                };
                map.insert(key, to_json(v));
            }
            serde_json::Value::Object(map)
        }
    }
}

/// Converts JSON into a value tree.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Text(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}

fn stringify_key(key: &Value) -> String {
    match key {
        Value::Integer(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_document() {
        let json = json!({
            "name": "Alice",
            "age": 30,
            "score": 9.5,
            "tags": ["a", "b"],
            "deleted": false,
            "note": null,
        });
        let value = from_json(&json);
        assert_eq!(to_json(&value), json);
    }

    #[test]
    fn integer_stays_integer() {
        let value = from_json(&json!(42));
        assert_eq!(value, Value::Integer(42));
    }

    #[test]
    fn bytes_become_base64_text() {
        let json = to_json(&Value::Bytes(vec![1, 2, 3]));
        assert_eq!(json, json!("AQID"));
    }
}
