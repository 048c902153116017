//! Extracting document values from SQL arguments.

use crate::error::{QueryError, QueryResult};
use quilldb_codec::{decode, SharedKeys, Value};
use rusqlite::types::ValueRef;
use std::sync::Arc;

/// Extracts the encoded document from a raw table row blob.
///
/// Rows may store the document body alongside other columns packed into
/// one blob; the accessor knows the layout and returns the encoded bytes.
/// A plain function pointer, so registered functions stay unwind-safe.
pub type BodyAccessor = fn(&[u8]) -> Option<Vec<u8>>;

/// Shared state captured by every registered function.
#[derive(Clone, Default)]
pub(crate) struct FuncContext {
    pub shared: Option<Arc<SharedKeys>>,
    pub accessor: Option<BodyAccessor>,
}

impl FuncContext {
    pub(crate) fn shared_keys(&self) -> Option<&SharedKeys> {
        self.shared.as_deref()
    }

    /// Interprets a document-body argument.
    ///
    /// A blob is decoded directly as an encoded document; when that fails
    /// and an accessor is registered, the blob is treated as a raw row
    /// body and the accessor extracts the document from it. An empty blob
    /// stands in for a deleted revision and reads as an empty map. A SQL
    /// NULL argument yields `None`.
    pub(crate) fn doc_root(&self, arg: ValueRef<'_>) -> QueryResult<Option<Value>> {
        let bytes = match arg {
            ValueRef::Null => return Ok(None),
            ValueRef::Blob(bytes) => bytes,
            _ => {
                return Err(QueryError::InvalidDocument(
                    "expected a document blob".into(),
                ))
            }
        };
        if bytes.is_empty() {
            return Ok(Some(Value::Map(Vec::new())));
        }
        if let Ok(root) = decode(bytes) {
            return Ok(Some(root));
        }
        if let Some(accessor) = &self.accessor {
            if let Some(extracted) = accessor(bytes) {
                if extracted.is_empty() {
                    return Ok(Some(Value::Map(Vec::new())));
                }
                return decode(&extracted)
                    .map(Some)
                    .map_err(|e| QueryError::InvalidDocument(e.to_string()));
            }
            return Ok(Some(Value::Map(Vec::new())));
        }
        Err(QueryError::InvalidDocument(
            "blob is not an encoded document".into(),
        ))
    }
}

/// Converts a SQL argument into a comparison value.
///
/// A SQL NULL yields `None` (it matches nothing); a zero-length blob is
/// the conventional representation of an encoded null.
pub(crate) fn arg_value(arg: ValueRef<'_>) -> QueryResult<Option<Value>> {
    Ok(match arg {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(Value::Integer(n)),
        ValueRef::Real(f) => Some(Value::Float(f)),
        ValueRef::Text(text) => Some(Value::Text(
            std::str::from_utf8(text)
                .map_err(|_| QueryError::InvalidDocument("non-UTF-8 text".into()))?
                .to_string(),
        )),
        ValueRef::Blob(bytes) if bytes.is_empty() => Some(Value::Null),
        ValueRef::Blob(bytes) => Some(Value::Bytes(bytes.to_vec())),
    })
}

/// Coerces an argument to a double, decoding blob-encoded numbers.
pub(crate) fn numeric_arg(fctx: &FuncContext, arg: ValueRef<'_>) -> QueryResult<f64> {
    match arg {
        ValueRef::Integer(n) => Ok(n as f64),
        ValueRef::Real(f) => Ok(f),
        ValueRef::Text(text) => std::str::from_utf8(text)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(QueryError::NotNumeric),
        ValueRef::Blob(_) => {
            let root = fctx.doc_root(arg)?.ok_or(QueryError::NotNumeric)?;
            root.as_f64().ok_or(QueryError::NotNumeric)
        }
        ValueRef::Null => Err(QueryError::NotNumeric),
    }
}

/// The raw bytes of an argument, for slice-comparison functions.
pub(crate) fn arg_slice(arg: ValueRef<'_>) -> Option<Vec<u8>> {
    match arg {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(n.to_string().into_bytes()),
        ValueRef::Real(f) => Some(f.to_string().into_bytes()),
        ValueRef::Text(text) => Some(text.to_vec()),
        ValueRef::Blob(bytes) => Some(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilldb_codec::encode;

    #[test]
    fn doc_root_decodes_blobs() {
        let fctx = FuncContext::default();
        let doc = Value::map_from(vec![("x", Value::Integer(1))]);
        let bytes = encode(&doc);
        let root = fctx.doc_root(ValueRef::Blob(&bytes)).unwrap().unwrap();
        assert_eq!(root.get("x"), Some(&Value::Integer(1)));
    }

    #[test]
    fn doc_root_null_and_empty() {
        let fctx = FuncContext::default();
        assert!(fctx.doc_root(ValueRef::Null).unwrap().is_none());
        let empty = fctx.doc_root(ValueRef::Blob(&[])).unwrap().unwrap();
        assert_eq!(empty, Value::Map(Vec::new()));
    }

    #[test]
    fn doc_root_uses_accessor_for_raw_rows() {
        // Row format: one length byte of junk prefix, then the document.
        let doc = encode(&Value::map_from(vec![("y", Value::Integer(2))]));
        let mut row = vec![0xEE];
        row.extend_from_slice(&doc);

        let fctx = FuncContext {
            shared: None,
            accessor: Some(|raw: &[u8]| Some(raw[1..].to_vec())),
        };
        let root = fctx.doc_root(ValueRef::Blob(&row)).unwrap().unwrap();
        assert_eq!(root.get("y"), Some(&Value::Integer(2)));
    }

    #[test]
    fn arg_value_conventions() {
        assert_eq!(arg_value(ValueRef::Null).unwrap(), None);
        assert_eq!(
            arg_value(ValueRef::Blob(&[])).unwrap(),
            Some(Value::Null),
            "zero blob is an encoded null"
        );
        assert_eq!(
            arg_value(ValueRef::Integer(7)).unwrap(),
            Some(Value::Integer(7))
        );
    }

    #[test]
    fn numeric_coercion() {
        let fctx = FuncContext::default();
        assert_eq!(numeric_arg(&fctx, ValueRef::Integer(3)).unwrap(), 3.0);
        assert_eq!(numeric_arg(&fctx, ValueRef::Real(2.5)).unwrap(), 2.5);
        assert_eq!(
            numeric_arg(&fctx, ValueRef::Text(b"4.5")).unwrap(),
            4.5
        );
        let encoded = encode(&Value::Float(9.0));
        assert_eq!(
            numeric_arg(&fctx, ValueRef::Blob(&encoded)).unwrap(),
            9.0
        );
        assert!(numeric_arg(&fctx, ValueRef::Null).is_err());
        assert!(numeric_arg(&fctx, ValueRef::Text(b"nope")).is_err());
    }
}
