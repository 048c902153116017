//! Mapping document values back to SQL results.

use quilldb_codec::{encode, Value, ValueType};
use rusqlite::types::Value as SqlValue;

/// Converts a path-evaluation result into a SQL value.
///
/// Missing (`None`) becomes SQL NULL. An encoded null becomes a
/// zero-length blob, which is how the SQL layer tells "the property is
/// null" apart from "the property does not exist"; SQLite offers no way
/// to add a type, so the empty blob is the convention. Containers are
/// re-encoded so nested expressions can keep drilling in.
pub(crate) fn to_sql_value(value: Option<&Value>) -> SqlValue {
    let Some(value) = value else {
        return SqlValue::Null;
    };
    match value {
        Value::Null => SqlValue::Blob(Vec::new()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Array(_) | Value::Map(_) => SqlValue::Blob(encode(value)),
    }
}

/// The integer type tag reported by `fl_type`: −1 for missing, otherwise
/// the value's [`ValueType`].
pub(crate) fn type_tag(value: Option<&Value>) -> i64 {
    value.map_or(-1, |v| i64::from(v.value_type() as i32))
}
