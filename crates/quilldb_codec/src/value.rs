//! Dynamic document value type.

use crate::shared_keys::SharedKeys;

/// Type tag for a [`Value`], in the order the query layer exposes them.
///
/// The numeric values are part of the public contract: `fl_type` returns
/// them to SQL, with −1 reserved for "no value at this path".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ValueType {
    /// Explicit null (distinct from a missing property).
    Null = 0,
    /// Boolean.
    Bool = 1,
    /// Integer or float.
    Number = 2,
    /// UTF-8 text.
    Text = 3,
    /// Raw bytes.
    Bytes = 4,
    /// Array of values.
    Array = 5,
    /// Key-value map.
    Map = 6,
}

/// A dynamic document value.
///
/// This is the in-memory form of the canonical binary encoding: the tree a
/// document body decodes into, and the tree an encoder serializes back out.
/// Map keys are either text or, when a [`SharedKeys`] dictionary is in
/// play, small integers referencing interned property names.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Double-precision float.
    Float(f64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of key-value pairs.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Builds a map value from string keys.
    pub fn map_from<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (Value::Text(k.into()), v))
                .collect(),
        )
    }

    /// Returns the type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Integer(_) | Value::Float(_) => ValueType::Number,
            Value::Text(_) => ValueType::Text,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Array(_) => ValueType::Array,
            Value::Map(_) => ValueType::Map,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float, coercing integers.
    ///
    /// Returns `None` for non-numeric values.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a text key in this map value.
    ///
    /// Integer keys are not resolved; use [`Value::get_with_keys`] when the
    /// map may have been encoded against a shared-key dictionary.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Look up a key in this map value, resolving integer keys through the
    /// shared-key dictionary.
    pub fn get_with_keys(&self, key: &str, shared: Option<&SharedKeys>) -> Option<&Value> {
        let pairs = self.as_map()?;
        pairs
            .iter()
            .find(|(k, _)| match k {
                Value::Text(s) => s == key,
                Value::Integer(id) => shared
                    .and_then(|sk| sk.key_for_id(*id))
                    .is_some_and(|name| name == key),
                _ => false,
            })
            .map(|(_, v)| v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_accessors() {
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(true).is_null());

        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_bool(), None);

        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::Text("42".to_string()).as_integer(), None);

        assert_eq!(Value::Text("hello".to_string()).as_text(), Some("hello"));
        assert_eq!(Value::Bytes(vec![1, 2, 3]).as_bytes(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Text("3".into()).as_f64(), None);
    }

    #[test]
    fn type_tags() {
        assert_eq!(Value::Null.value_type() as i32, 0);
        assert_eq!(Value::Bool(false).value_type() as i32, 1);
        assert_eq!(Value::Integer(1).value_type() as i32, 2);
        assert_eq!(Value::Float(1.0).value_type() as i32, 2);
        assert_eq!(Value::Text(String::new()).value_type() as i32, 3);
        assert_eq!(Value::Bytes(vec![]).value_type() as i32, 4);
        assert_eq!(Value::Array(vec![]).value_type() as i32, 5);
        assert_eq!(Value::Map(vec![]).value_type() as i32, 6);
    }

    #[test]
    fn map_get() {
        let map = Value::map_from(vec![
            ("name", Value::Text("Alice".to_string())),
            ("age", Value::Integer(30)),
        ]);

        assert_eq!(map.get("name"), Some(&Value::Text("Alice".to_string())));
        assert_eq!(map.get("age"), Some(&Value::Integer(30)));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn map_get_with_shared_keys() {
        let mut sk = SharedKeys::new();
        let id = sk.intern("name").unwrap();

        let map = Value::Map(vec![(
            Value::Integer(i64::from(id)),
            Value::Text("Alice".to_string()),
        )]);

        assert_eq!(map.get("name"), None);
        assert_eq!(
            map.get_with_keys("name", Some(&sk)),
            Some(&Value::Text("Alice".to_string()))
        );
    }
}
