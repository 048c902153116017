//! Canonical binary decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Decode a value from encoded bytes.
///
/// # Errors
///
/// Returns an error if the bytes are truncated, non-canonical, or contain
/// forbidden constructs (half/single floats, indefinite-length items).
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode_value()?;
    if !decoder.is_empty() {
        return Err(CodecError::invalid_structure("trailing bytes after value"));
    }
    Ok(value)
}

/// Maximum allowed element count for arrays and maps.
/// Prevents allocation-based blowups from untrusted input.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// A streaming decoder over encoded bytes.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Decode the next value.
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode_value(&mut self) -> CodecResult<Value> {
        let initial = self.read_byte()?;
        let major_type = initial >> 5;
        let info = initial & 0x1f;

        match major_type {
            0 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::invalid_structure("integer out of range"))
            }
            1 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-n - 1))
                    .map_err(|_| CodecError::invalid_structure("integer out of range"))
            }
            2 => {
                let len = self.read_length(info, MAX_BYTES_LENGTH)?;
                Ok(Value::Bytes(self.read_bytes(len)?.to_vec()))
            }
            3 => {
                let len = self.read_length(info, MAX_BYTES_LENGTH)?;
                let bytes = self.read_bytes(len)?;
                std::str::from_utf8(bytes)
                    .map(|s| Value::Text(s.to_string()))
                    .map_err(|_| CodecError::InvalidUtf8)
            }
            4 => {
                let count = self.read_length(info, MAX_CONTAINER_ELEMENTS)?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.decode_value()?);
                }
                Ok(Value::Array(items))
            }
            5 => {
                let count = self.read_length(info, MAX_CONTAINER_ELEMENTS)?;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let key = self.decode_value()?;
                    let value = self.decode_value()?;
                    pairs.push((key, value));
                }
                Ok(Value::Map(pairs))
            }
            7 => self.decode_simple(info),
            _ => Err(CodecError::invalid_structure("unsupported major type")),
        }
    }

    fn decode_simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Float(f64::from_be_bytes(raw)))
            }
            25 | 26 => Err(CodecError::invalid_structure(
                "non-canonical: floats must be 8-byte doubles",
            )),
            31 => Err(CodecError::invalid_structure(
                "indefinite-length items are forbidden",
            )),
            _ => Err(CodecError::invalid_structure("unsupported simple value")),
        }
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        if self.pos >= self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_length(&mut self, info: u8, max: u64) -> CodecResult<usize> {
        let len = self.read_argument(info)?;
        if len > max {
            return Err(CodecError::invalid_structure("length exceeds limit"));
        }
        usize::try_from(len).map_err(|_| CodecError::invalid_structure("length exceeds limit"))
    }

    fn read_argument(&mut self, info: u8) -> CodecResult<u64> {
        match info {
            0..=23 => Ok(u64::from(info)),
            24 => {
                let b = self.read_byte()?;
                if b < 24 {
                    return Err(CodecError::invalid_structure("non-canonical integer"));
                }
                Ok(u64::from(b))
            }
            25 => {
                let bytes = self.read_bytes(2)?;
                let n = u16::from_be_bytes([bytes[0], bytes[1]]);
                if u64::from(n) <= 0xFF {
                    return Err(CodecError::invalid_structure("non-canonical integer"));
                }
                Ok(u64::from(n))
            }
            26 => {
                let bytes = self.read_bytes(4)?;
                let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if u64::from(n) <= 0xFFFF {
                    return Err(CodecError::invalid_structure("non-canonical integer"));
                }
                Ok(u64::from(n))
            }
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let n = u64::from_be_bytes(raw);
                if n <= 0xFFFF_FFFF {
                    return Err(CodecError::invalid_structure("non-canonical integer"));
                }
                Ok(n)
            }
            _ => Err(CodecError::invalid_structure("invalid length encoding")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode;

    #[test]
    fn roundtrip_scalars() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Integer(0),
            Value::Integer(-100),
            Value::Integer(i64::MAX),
            Value::Integer(i64::MIN),
            Value::Float(3.5),
            Value::Float(-0.25),
            Value::Text("hello world".to_string()),
            Value::Bytes(vec![1, 2, 3, 4, 5]),
        ] {
            let bytes = encode(&value);
            assert_eq!(decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn roundtrip_nested() {
        let value = Value::map_from(vec![
            (
                "users",
                Value::Array(vec![
                    Value::map_from(vec![
                        ("name", Value::Text("Alice".to_string())),
                        ("age", Value::Integer(30)),
                    ]),
                    Value::map_from(vec![
                        ("name", Value::Text("Bob".to_string())),
                        ("score", Value::Float(9.5)),
                    ]),
                ]),
            ),
            ("count", Value::Integer(2)),
        ]);
        let bytes = encode(&value);
        let decoded = decode(&bytes).unwrap();
        // Encoding sorts map keys, so compare by lookup instead of equality.
        assert_eq!(decoded.get("count"), Some(&Value::Integer(2)));
        let users = decoded.get("users").unwrap().as_array().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].get("name").unwrap().as_text(), Some("Alice"));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = encode(&Value::Text("hello".to_string()));
        assert!(matches!(
            decode(&bytes[..3]),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&Value::Integer(1));
        bytes.push(0x00);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn rejects_non_canonical_integer() {
        // 24 with argument 5 could have been encoded in the initial byte.
        assert!(decode(&[0x18, 0x05]).is_err());
    }

    #[test]
    fn rejects_indefinite_length() {
        assert!(decode(&[0x9f]).is_err());
    }
}
