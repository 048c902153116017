//! Canonical binary encoder.

use crate::shared_keys::SharedKeys;
use crate::value::Value;

/// Encode a value to canonical bytes.
///
/// The output is deterministic: map entries are sorted by their encoded key
/// (length-first, then bytewise), integers use the shortest possible form,
/// and floats are always 8-byte doubles. Identical trees produce identical
/// bytes, which the revision digests rely on.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_value(value);
    encoder.into_bytes()
}

/// Encode a value, substituting shared-key IDs for eligible map keys.
pub fn encode_with_keys(value: &Value, shared: &mut SharedKeys) -> Vec<u8> {
    let mut encoder = Encoder::with_shared_keys(shared);
    encoder.write_value(value);
    encoder.into_bytes()
}

/// A canonical binary encoder.
pub struct Encoder<'a> {
    buffer: Vec<u8>,
    shared: Option<&'a mut SharedKeys>,
}

impl<'a> Encoder<'a> {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            shared: None,
        }
    }

    /// Create an encoder that interns eligible map keys into `shared`.
    pub fn with_shared_keys(shared: &'a mut SharedKeys) -> Self {
        Self {
            buffer: Vec::new(),
            shared: Some(shared),
        }
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Encode a value into the buffer.
    pub fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(b) => self.buffer.push(if *b { 0xf5 } else { 0xf4 }),
            Value::Integer(n) => self.write_integer(*n),
            Value::Float(f) => self.write_float(*f),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Text(s) => self.write_text(s),
            Value::Array(arr) => self.write_array(arr),
            Value::Map(pairs) => self.write_map(pairs),
        }
    }

    #[allow(clippy::cast_sign_loss)]
    fn write_integer(&mut self, n: i64) {
        if n >= 0 {
            self.write_head(0, n as u64);
        } else {
            // Negative integers encode -(n+1), so -1 is argument 0.
            self.write_head(1, (-(n + 1)) as u64);
        }
    }

    fn write_float(&mut self, f: f64) {
        self.buffer.push(0xfb);
        self.buffer.extend_from_slice(&f.to_be_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_head(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if u8::try_from(value).is_ok() {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_head(2, bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    fn write_text(&mut self, text: &str) {
        self.write_head(3, text.len() as u64);
        self.buffer.extend_from_slice(text.as_bytes());
    }

    fn write_array(&mut self, arr: &[Value]) {
        self.write_head(4, arr.len() as u64);
        for item in arr {
            self.write_value(item);
        }
    }

    fn write_map(&mut self, pairs: &[(Value, Value)]) {
        // Substitute shared-key IDs before sorting so the sort order matches
        // what a decoder will see.
        let keyed: Vec<(Value, &Value)> = pairs
            .iter()
            .map(|(k, v)| (self.substitute_key(k), v))
            .collect();

        let mut encoded: Vec<(Vec<u8>, &Value)> = keyed
            .iter()
            .map(|(k, v)| {
                let mut key_encoder = Encoder::new();
                key_encoder.write_value(k);
                (key_encoder.into_bytes(), *v)
            })
            .collect();

        encoded.sort_by(|a, b| match a.0.len().cmp(&b.0.len()) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        self.write_head(5, pairs.len() as u64);
        for (key_bytes, value) in encoded {
            self.buffer.extend_from_slice(&key_bytes);
            self.write_value(value);
        }
    }

    fn substitute_key(&mut self, key: &Value) -> Value {
        if let (Value::Text(s), Some(shared)) = (key, self.shared.as_deref_mut()) {
            if let Ok(id) = shared.intern(s) {
                return Value::Integer(i64::from(id));
            }
        }
        key.clone()
    }
}

impl Default for Encoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    #[test]
    fn encode_simple_values() {
        assert_eq!(encode(&Value::Null), vec![0xf6]);
        assert_eq!(encode(&Value::Bool(false)), vec![0xf4]);
        assert_eq!(encode(&Value::Bool(true)), vec![0xf5]);
    }

    #[test]
    fn encode_integers() {
        assert_eq!(encode(&Value::Integer(0)), vec![0x00]);
        assert_eq!(encode(&Value::Integer(23)), vec![0x17]);
        assert_eq!(encode(&Value::Integer(24)), vec![0x18, 24]);
        assert_eq!(encode(&Value::Integer(256)), vec![0x19, 0x01, 0x00]);
        assert_eq!(encode(&Value::Integer(-1)), vec![0x20]);
        assert_eq!(encode(&Value::Integer(-100)), vec![0x38, 99]);
    }

    #[test]
    fn encode_float_is_double() {
        let bytes = encode(&Value::Float(1.5));
        assert_eq!(bytes[0], 0xfb);
        assert_eq!(bytes.len(), 9);
        assert_eq!(f64::from_be_bytes(bytes[1..9].try_into().unwrap()), 1.5);
    }

    #[test]
    fn encode_strings_and_bytes() {
        assert_eq!(encode(&Value::Text("a".into())), vec![0x61, b'a']);
        assert_eq!(encode(&Value::Bytes(vec![1, 2, 3])), vec![0x43, 1, 2, 3]);
    }

    #[test]
    fn encode_map_sorted() {
        let map = Value::map_from(vec![
            ("bb", Value::Integer(2)),
            ("a", Value::Integer(1)),
        ]);
        // Shorter key first: "a", then "bb".
        assert_eq!(
            encode(&map),
            vec![0xa2, 0x61, b'a', 0x01, 0x62, b'b', b'b', 0x02]
        );
    }

    #[test]
    fn deterministic_encoding() {
        let map1 = Value::map_from(vec![
            ("z", Value::Integer(1)),
            ("a", Value::Integer(2)),
        ]);
        let map2 = Value::map_from(vec![
            ("a", Value::Integer(2)),
            ("z", Value::Integer(1)),
        ]);
        assert_eq!(encode(&map1), encode(&map2));
    }

    #[test]
    fn shared_keys_substitution() {
        let mut sk = SharedKeys::new();
        let map = Value::map_from(vec![("name", Value::Text("x".into()))]);
        let bytes = encode_with_keys(&map, &mut sk);

        let decoded = decode(&bytes).unwrap();
        let pairs = decoded.as_map().unwrap();
        assert_eq!(pairs[0].0, Value::Integer(0));
        assert_eq!(sk.key_for_id(0), Some("name"));
    }
}
