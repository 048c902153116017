//! SQL host-function registry.

use crate::error::{QueryError, QueryResult};
use crate::param::{arg_slice, arg_value, numeric_arg, BodyAccessor, FuncContext};
use crate::result::{to_sql_value, type_tag};
use base64::Engine;
use quilldb_codec::{Path, SharedKeys, Value};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use std::sync::Arc;

/// Registers all document query functions on a connection.
///
/// `shared` resolves integer map keys in encoded bodies; `accessor`
/// extracts the encoded document from raw row blobs. Every function is
/// registered deterministic except `uuid`, so the planner may fold them
/// into index expressions.
pub fn register_functions(
    conn: &Connection,
    shared: Option<Arc<SharedKeys>>,
    accessor: Option<BodyAccessor>,
) -> rusqlite::Result<()> {
    let fctx = FuncContext { shared, accessor };
    let det = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    let c = fctx.clone();
    conn.create_scalar_function("fl_value", 2, det, move |ctx| {
        let value = path_eval(&c, ctx)?;
        Ok(to_sql_value(value.as_ref()))
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("fl_exists", 2, det, move |ctx| {
        let value = path_eval(&c, ctx)?;
        Ok(SqlValue::Integer(i64::from(value.is_some())))
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("fl_type", 2, det, move |ctx| {
        let value = path_eval(&c, ctx)?;
        Ok(SqlValue::Integer(type_tag(value.as_ref())))
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("fl_count", 2, det, move |ctx| {
        Ok(match path_eval(&c, ctx)? {
            Some(Value::Array(items)) => SqlValue::Integer(items.len() as i64),
            Some(Value::Map(pairs)) => SqlValue::Integer(pairs.len() as i64),
            _ => SqlValue::Null,
        })
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("fl_contains", -1, det, move |ctx| {
        fl_contains(&c, ctx).map_err(Into::into)
    })?;

    register_array_aggregates(conn, det, &fctx)?;
    register_conditionals(conn, det, &fctx)?;
    register_text_helpers(conn, det, &fctx)?;
    register_math(conn, det, &fctx)?;

    conn.create_scalar_function("uuid", 0, FunctionFlags::SQLITE_UTF8, move |_ctx| {
        Ok(SqlValue::Text(uuid::Uuid::new_v4().to_string()))
    })?;

    Ok(())
}

/// Evaluates the conventional (body, path) argument pair.
fn path_eval(fctx: &FuncContext, ctx: &Context<'_>) -> rusqlite::Result<Option<Value>> {
    let Some(root) = fctx.doc_root(ctx.get_raw(0)).map_err(rusqlite::Error::from)? else {
        return Ok(None);
    };
    let path = path_arg(ctx.get_raw(1)).map_err(rusqlite::Error::from)?;
    Ok(path.eval(&root, fctx.shared_keys()).cloned())
}

fn path_arg(arg: ValueRef<'_>) -> QueryResult<Path> {
    let ValueRef::Text(text) = arg else {
        return Err(QueryError::Path(quilldb_codec::CodecError::invalid_path(
            "path must be text",
        )));
    };
    let text = std::str::from_utf8(text)
        .map_err(|_| QueryError::Path(quilldb_codec::CodecError::invalid_path("non-UTF-8 path")))?;
    Ok(Path::parse(text)?)
}

// fl_contains(body, path, all?, v1, ...) -> 0/1
fn fl_contains(fctx: &FuncContext, ctx: &Context<'_>) -> QueryResult<SqlValue> {
    if ctx.len() < 4 {
        return Err(QueryError::Arity {
            function: "fl_contains",
        });
    }
    let Some(root) = fctx.doc_root(ctx.get_raw(0))? else {
        return Ok(SqlValue::Null);
    };
    let path = path_arg(ctx.get_raw(1))?;
    let Some(Value::Array(items)) = path.eval(&root, fctx.shared_keys()) else {
        return Ok(SqlValue::Integer(0));
    };

    let all = matches!(ctx.get_raw(2), ValueRef::Integer(n) if n != 0);
    let probes = ctx.len() - 3;
    let needed = if all { probes } else { 1 };

    let mut found = 0usize;
    for i in 3..ctx.len() {
        let Some(probe) = arg_value(ctx.get_raw(i))? else {
            continue; // A SQL null matches nothing.
        };
        if items.iter().any(|item| contains_match(item, &probe)) {
            found += 1;
            if found >= needed {
                return Ok(SqlValue::Integer(1));
            }
        }
    }
    Ok(SqlValue::Integer(0))
}

fn contains_match(item: &Value, probe: &Value) -> bool {
    match probe {
        Value::Null => item.is_null(),
        Value::Integer(n) => item.as_integer() == Some(*n),
        Value::Float(f) => item.as_f64() == Some(*f),
        Value::Text(s) => item.as_text() == Some(s.as_str()),
        Value::Bytes(b) => item.as_bytes() == Some(b.as_slice()),
        _ => false,
    }
}

/// What a variadic array aggregate is operating on.
enum AggInput {
    Items(Vec<Value>),
    SqlNull,
    NotArray,
}

/// Collects the elements of every array-typed argument. A SQL NULL
/// argument makes the whole result NULL; a non-array argument yields the
/// zero-blob (encoded null) result instead.
fn gather_items(fctx: &FuncContext, ctx: &Context<'_>, from: usize) -> QueryResult<AggInput> {
    let mut items = Vec::new();
    for i in from..ctx.len() {
        match ctx.get_raw(i) {
            ValueRef::Null => return Ok(AggInput::SqlNull),
            arg @ ValueRef::Blob(_) => match fctx.doc_root(arg)? {
                Some(Value::Array(more)) => items.extend(more),
                _ => return Ok(AggInput::NotArray),
            },
            _ => return Ok(AggInput::NotArray),
        }
    }
    Ok(AggInput::Items(items))
}

fn register_array_aggregates(
    conn: &Connection,
    det: FunctionFlags,
    fctx: &FuncContext,
) -> rusqlite::Result<()> {
    let c = fctx.clone();
    conn.create_scalar_function("array_sum", -1, det, move |ctx| {
        Ok(match gather_items(&c, ctx, 0).map_err(rusqlite::Error::from)? {
            AggInput::Items(items) => {
                SqlValue::Real(items.iter().filter_map(Value::as_f64).sum())
            }
            AggInput::SqlNull => SqlValue::Null,
            AggInput::NotArray => SqlValue::Blob(Vec::new()),
        })
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_avg", -1, det, move |ctx| {
        Ok(match gather_items(&c, ctx, 0).map_err(rusqlite::Error::from)? {
            AggInput::Items(items) => {
                let numbers: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
                if numbers.is_empty() {
                    SqlValue::Real(0.0)
                } else {
                    SqlValue::Real(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            AggInput::SqlNull => SqlValue::Null,
            AggInput::NotArray => SqlValue::Blob(Vec::new()),
        })
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_min", -1, det, move |ctx| {
        array_extreme(&c, ctx, f64::min)
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_max", -1, det, move |ctx| {
        array_extreme(&c, ctx, f64::max)
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_count", -1, det, move |ctx| {
        Ok(match gather_items(&c, ctx, 0).map_err(rusqlite::Error::from)? {
            AggInput::Items(items) => {
                SqlValue::Integer(items.iter().filter(|v| !v.is_null()).count() as i64)
            }
            AggInput::SqlNull => SqlValue::Null,
            AggInput::NotArray => SqlValue::Blob(Vec::new()),
        })
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_length", -1, det, move |ctx| {
        Ok(match gather_items(&c, ctx, 0).map_err(rusqlite::Error::from)? {
            AggInput::Items(items) => SqlValue::Integer(items.len() as i64),
            AggInput::SqlNull => SqlValue::Null,
            AggInput::NotArray => SqlValue::Blob(Vec::new()),
        })
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_ifnull", -1, det, move |ctx| {
        Ok(match gather_items(&c, ctx, 0).map_err(rusqlite::Error::from)? {
            AggInput::Items(items) => match items.iter().find(|v| !v.is_null()) {
                Some(value) => to_sql_value(Some(value)),
                None => SqlValue::Blob(Vec::new()),
            },
            AggInput::SqlNull => SqlValue::Null,
            AggInput::NotArray => SqlValue::Blob(Vec::new()),
        })
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("array_contains", 2, det, move |ctx| {
        let root = c.doc_root(ctx.get_raw(0)).map_err(rusqlite::Error::from)?;
        let Some(Value::Array(items)) = root else {
            return Ok(SqlValue::Integer(0));
        };
        let Some(probe) = arg_value(ctx.get_raw(1)).map_err(rusqlite::Error::from)? else {
            return Ok(SqlValue::Integer(0));
        };
        let found = items.iter().any(|item| contains_match(item, &probe));
        Ok(SqlValue::Integer(i64::from(found)))
    })?;

    Ok(())
}

fn array_extreme(
    fctx: &FuncContext,
    ctx: &Context<'_>,
    pick: fn(f64, f64) -> f64,
) -> rusqlite::Result<SqlValue> {
    Ok(match gather_items(fctx, ctx, 0).map_err(rusqlite::Error::from)? {
        AggInput::Items(items) => {
            let result = items
                .iter()
                .filter_map(Value::as_f64)
                .reduce(pick);
            match result {
                Some(value) => SqlValue::Real(value),
                None => SqlValue::Blob(Vec::new()),
            }
        }
        AggInput::SqlNull => SqlValue::Null,
        AggInput::NotArray => SqlValue::Blob(Vec::new()),
    })
}

fn register_conditionals(
    conn: &Connection,
    det: FunctionFlags,
    fctx: &FuncContext,
) -> rusqlite::Result<()> {
    conn.create_scalar_function("missingif", 2, det, move |ctx| {
        Ok(compare_pair(ctx, SqlValue::Null))
    })?;

    conn.create_scalar_function("nullif", 2, det, move |ctx| {
        Ok(compare_pair(ctx, SqlValue::Blob(Vec::new())))
    })?;

    conn.create_scalar_function("nanif", 2, det, move |ctx| {
        Ok(compare_pair(ctx, SqlValue::Real(f64::NAN)))
    })?;

    conn.create_scalar_function("neginfif", 2, det, move |ctx| {
        Ok(compare_pair(ctx, SqlValue::Real(f64::NEG_INFINITY)))
    })?;

    conn.create_scalar_function("posinfif", 2, det, move |ctx| {
        Ok(compare_pair(ctx, SqlValue::Real(f64::INFINITY)))
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("ifinf", -1, det, move |ctx| {
        first_number(&c, ctx, |n| !n.is_infinite())
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("ifnan", -1, det, move |ctx| {
        first_number(&c, ctx, |n| !n.is_nan())
    })?;

    let c = fctx.clone();
    conn.create_scalar_function("ifnanorinf", -1, det, move |ctx| {
        first_number(&c, ctx, f64::is_finite)
    })?;

    Ok(())
}

/// Shared body of the `*if` pair functions: either operand NULL or empty
/// yields SQL NULL; equal operands yield `on_equal`; otherwise the first
/// operand passes through unchanged.
fn compare_pair(ctx: &Context<'_>, on_equal: SqlValue) -> SqlValue {
    let a = arg_slice(ctx.get_raw(0));
    let b = arg_slice(ctx.get_raw(1));
    match (a, b) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
            if a == b {
                on_equal
            } else {
                SqlValue::from(ctx.get_raw(0))
            }
        }
        _ => SqlValue::Null,
    }
}

/// First argument that is a number passing `keep`; NULL when none do.
fn first_number(
    fctx: &FuncContext,
    ctx: &Context<'_>,
    keep: fn(f64) -> bool,
) -> rusqlite::Result<SqlValue> {
    for i in 0..ctx.len() {
        let Ok(number) = numeric_arg(fctx, ctx.get_raw(i)) else {
            break;
        };
        if keep(number) {
            return Ok(SqlValue::Real(number));
        }
    }
    Ok(SqlValue::Null)
}

fn register_text_helpers(
    conn: &Connection,
    det: FunctionFlags,
    _fctx: &FuncContext,
) -> rusqlite::Result<()> {
    for name in ["base64", "base64_encode"] {
        conn.create_scalar_function(name, 1, det, move |ctx| {
            let bytes = arg_slice(ctx.get_raw(0)).unwrap_or_default();
            Ok(SqlValue::Text(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ))
        })?;
    }

    conn.create_scalar_function("base64_decode", 1, det, move |ctx| {
        let was_text = matches!(ctx.get_raw(0), ValueRef::Text(_));
        let bytes = arg_slice(ctx.get_raw(0)).unwrap_or_default();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(bytes)
            .map_err(|e| rusqlite::Error::from(QueryError::InvalidDocument(e.to_string())))?;
        Ok(match String::from_utf8(decoded) {
            Ok(text) if was_text => SqlValue::Text(text),
            Ok(text) => SqlValue::Blob(text.into_bytes()),
            Err(err) => SqlValue::Blob(err.into_bytes()),
        })
    })?;

    conn.create_scalar_function("contains", 2, det, move |ctx| {
        let haystack = arg_slice(ctx.get_raw(0)).unwrap_or_default();
        let needle = arg_slice(ctx.get_raw(1)).unwrap_or_default();
        let found = !needle.is_empty()
            && haystack
                .windows(needle.len())
                .any(|window| window == needle.as_slice());
        Ok(SqlValue::Integer(i64::from(found)))
    })?;

    conn.create_scalar_function("regexp_like", 2, det, move |ctx| {
        let text = String::from_utf8(arg_slice(ctx.get_raw(0)).unwrap_or_default())
            .map_err(|_| rusqlite::Error::from(QueryError::InvalidDocument("non-UTF-8".into())))?;
        let pattern = String::from_utf8(arg_slice(ctx.get_raw(1)).unwrap_or_default())
            .map_err(|_| rusqlite::Error::from(QueryError::InvalidDocument("non-UTF-8".into())))?;
        let regex = regex::Regex::new(&pattern)
            .map_err(|e| rusqlite::Error::from(QueryError::Regex(e.to_string())))?;
        Ok(SqlValue::Integer(i64::from(regex.is_match(&text))))
    })?;

    Ok(())
}

fn register_math(
    conn: &Connection,
    det: FunctionFlags,
    fctx: &FuncContext,
) -> rusqlite::Result<()> {
    let unary: [(&str, fn(f64) -> f64); 15] = [
        ("abs", f64::abs),
        ("acos", f64::acos),
        ("asin", f64::asin),
        ("atan", f64::atan),
        ("ceil", f64::ceil),
        ("cos", f64::cos),
        ("degrees", f64::to_degrees),
        ("exp", f64::exp),
        ("ln", f64::ln),
        ("log", f64::log10),
        ("floor", f64::floor),
        ("radians", f64::to_radians),
        ("sin", f64::sin),
        ("sqrt", f64::sqrt),
        ("tan", f64::tan),
    ];
    for (name, op) in unary {
        let c = fctx.clone();
        conn.create_scalar_function(name, 1, det, move |ctx| {
            let x = numeric_arg(&c, ctx.get_raw(0)).map_err(rusqlite::Error::from)?;
            Ok(SqlValue::Real(op(x)))
        })?;
    }

    let binary: [(&str, fn(f64, f64) -> f64); 2] = [("atan2", f64::atan2), ("power", f64::powf)];
    for (name, op) in binary {
        let c = fctx.clone();
        conn.create_scalar_function(name, 2, det, move |ctx| {
            let x = numeric_arg(&c, ctx.get_raw(0)).map_err(rusqlite::Error::from)?;
            let y = numeric_arg(&c, ctx.get_raw(1)).map_err(rusqlite::Error::from)?;
            Ok(SqlValue::Real(op(x, y)))
        })?;
    }

    let constants: [(&str, f64); 2] = [("e", std::f64::consts::E), ("pi", std::f64::consts::PI)];
    for (name, value) in constants {
        conn.create_scalar_function(name, 0, det, move |_ctx| Ok(SqlValue::Real(value)))?;
    }

    let c = fctx.clone();
    conn.create_scalar_function("sign", 1, det, move |ctx| {
        let x = numeric_arg(&c, ctx.get_raw(0)).map_err(rusqlite::Error::from)?;
        Ok(SqlValue::Integer(if x == 0.0 {
            0
        } else if x < 0.0 {
            -1
        } else {
            1
        }))
    })?;

    // round and trunc take an optional digit count.
    for (name, op) in [("round", f64::round as fn(f64) -> f64), ("trunc", f64::trunc)] {
        let c = fctx.clone();
        conn.create_scalar_function(name, -1, det, move |ctx| {
            if ctx.len() != 1 && ctx.len() != 2 {
                return Err(QueryError::Arity { function: name }.into());
            }
            let x = numeric_arg(&c, ctx.get_raw(0)).map_err(rusqlite::Error::from)?;
            let digits = if ctx.len() == 2 {
                numeric_arg(&c, ctx.get_raw(1)).map_err(rusqlite::Error::from)?
            } else {
                0.0
            };
            let scale = 10f64.powf(digits);
            Ok(SqlValue::Real(op(x * scale) / scale))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilldb_codec::encode;
    use rusqlite::params;

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn, None, None).unwrap();
        conn
    }

    fn doc(json: serde_json::Value) -> Vec<u8> {
        encode(&quilldb_codec::json::from_json(&json))
    }

    fn query_one<T: rusqlite::types::FromSql>(
        conn: &Connection,
        sql: &str,
        body: &[u8],
    ) -> T {
        conn.query_row(sql, params![body], |row| row.get(0)).unwrap()
    }

    #[test]
    fn null_versus_missing() {
        let conn = connection();
        let body = doc(serde_json::json!({"x": null, "y": 1}));

        // An explicit null reads as a zero-length blob.
        let x: Option<Vec<u8>> = query_one(&conn, "SELECT fl_value(?1, 'x')", &body);
        assert_eq!(x, Some(Vec::new()));
        // A missing property reads as SQL NULL.
        let z: Option<Vec<u8>> = query_one(&conn, "SELECT fl_value(?1, 'z')", &body);
        assert_eq!(z, None);

        let exists_x: i64 = query_one(&conn, "SELECT fl_exists(?1, 'x')", &body);
        let exists_z: i64 = query_one(&conn, "SELECT fl_exists(?1, 'z')", &body);
        assert_eq!(exists_x, 1);
        assert_eq!(exists_z, 0);
    }

    #[test]
    fn value_extraction() {
        let conn = connection();
        let body = doc(serde_json::json!({
            "name": "Alice",
            "age": 30,
            "score": 9.5,
            "address": {"city": "Oslo"},
            "tags": ["a", "b", "c"],
        }));

        let name: String = query_one(&conn, "SELECT fl_value(?1, 'name')", &body);
        assert_eq!(name, "Alice");
        let age: i64 = query_one(&conn, "SELECT fl_value(?1, 'age')", &body);
        assert_eq!(age, 30);
        let score: f64 = query_one(&conn, "SELECT fl_value(?1, 'score')", &body);
        assert_eq!(score, 9.5);
        let city: String = query_one(&conn, "SELECT fl_value(?1, 'address.city')", &body);
        assert_eq!(city, "Oslo");
        let tag: String = query_one(&conn, "SELECT fl_value(?1, 'tags[1]')", &body);
        assert_eq!(tag, "b");
    }

    #[test]
    fn type_and_count() {
        let conn = connection();
        let body = doc(serde_json::json!({"n": null, "b": true, "x": 3, "s": "t",
            "arr": [1, 2], "obj": {"k": 1}}));

        let tag = |path: &str| -> i64 {
            conn.query_row("SELECT fl_type(?1, ?2)", params![body, path], |row| {
                row.get(0)
            })
            .unwrap()
        };
        assert_eq!(tag("n"), 0);
        assert_eq!(tag("b"), 1);
        assert_eq!(tag("x"), 2);
        assert_eq!(tag("s"), 3);
        assert_eq!(tag("arr"), 5);
        assert_eq!(tag("obj"), 6);
        assert_eq!(tag("missing"), -1);

        let arr_count: i64 = query_one(&conn, "SELECT fl_count(?1, 'arr')", &body);
        assert_eq!(arr_count, 2);
        let obj_count: i64 = query_one(&conn, "SELECT fl_count(?1, 'obj')", &body);
        assert_eq!(obj_count, 1);
        let scalar_count: Option<i64> = query_one(&conn, "SELECT fl_count(?1, 'x')", &body);
        assert_eq!(scalar_count, None);
    }

    #[test]
    fn contains_any_and_all() {
        let conn = connection();
        let body = doc(serde_json::json!({"nums": [1, 2, 3], "strs": ["a", "b"]}));

        let any: i64 = conn
            .query_row(
                "SELECT fl_contains(?1, 'nums', 0, 3, 99)",
                params![body],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(any, 1);

        let all_missing: i64 = conn
            .query_row(
                "SELECT fl_contains(?1, 'nums', 1, 3, 99)",
                params![body],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(all_missing, 0);

        let all_present: i64 = conn
            .query_row(
                "SELECT fl_contains(?1, 'strs', 1, 'a', 'b')",
                params![body],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(all_present, 1);
    }

    #[test]
    fn array_aggregates() {
        let conn = connection();
        let nums = encode(&quilldb_codec::json::from_json(&serde_json::json!([
            1, 2, 3, 4
        ])));

        let sum: f64 = query_one(&conn, "SELECT array_sum(?1)", &nums);
        assert_eq!(sum, 10.0);
        let avg: f64 = query_one(&conn, "SELECT array_avg(?1)", &nums);
        assert_eq!(avg, 2.5);
        let min: f64 = query_one(&conn, "SELECT array_min(?1)", &nums);
        assert_eq!(min, 1.0);
        let max: f64 = query_one(&conn, "SELECT array_max(?1)", &nums);
        assert_eq!(max, 4.0);
        let len: i64 = query_one(&conn, "SELECT array_length(?1)", &nums);
        assert_eq!(len, 4);

        let with_null = encode(&quilldb_codec::json::from_json(&serde_json::json!([
            1, null, 3
        ])));
        let count: i64 = query_one(&conn, "SELECT array_count(?1)", &with_null);
        assert_eq!(count, 2, "nulls are not counted");
        let first: i64 = query_one(&conn, "SELECT array_ifnull(?1)", &with_null);
        assert_eq!(first, 1);

        // A SQL NULL argument nulls the whole aggregate.
        let null_sum: Option<f64> = conn
            .query_row("SELECT array_sum(NULL)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(null_sum, None);

        // An empty array has no extremes.
        let empty = encode(&Value::Array(vec![]));
        let no_max: Option<Vec<u8>> = query_one(&conn, "SELECT array_max(?1)", &empty);
        assert_eq!(no_max, Some(Vec::new()));
    }

    #[test]
    fn array_contains_values() {
        let conn = connection();
        let nums = encode(&quilldb_codec::json::from_json(&serde_json::json!([
            1, "two", 3.5
        ])));
        let hit: i64 = conn
            .query_row("SELECT array_contains(?1, 'two')", params![nums], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(hit, 1);
        let miss: i64 = conn
            .query_row("SELECT array_contains(?1, 'four')", params![nums], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(miss, 0);
    }

    #[test]
    fn missingif_and_nullif_corrected_semantics() {
        let conn = connection();

        // Equal operands: missingif -> SQL NULL, nullif -> zero blob.
        let eq_missing: Option<String> = conn
            .query_row("SELECT missingif('a', 'a')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(eq_missing, None);
        let eq_null: Option<Vec<u8>> = conn
            .query_row("SELECT nullif('a', 'a')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(eq_null, Some(Vec::new()));

        // Different operands pass the first through.
        let diff: String = conn
            .query_row("SELECT missingif('a', 'b')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(diff, "a");

        // An empty or NULL operand returns SQL NULL, full stop. The
        // comparison must not run afterwards.
        let empty: Option<String> = conn
            .query_row("SELECT missingif('', '')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(empty, None);
        let null_arg: Option<String> = conn
            .query_row("SELECT nullif('a', NULL)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(null_arg, None);
    }

    #[test]
    fn special_value_conditionals() {
        let conn = connection();

        let nan: f64 = conn
            .query_row("SELECT nanif('x', 'x')", [], |row| row.get(0))
            .unwrap();
        assert!(nan.is_nan());
        let neg: f64 = conn
            .query_row("SELECT neginfif('x', 'x')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(neg, f64::NEG_INFINITY);
        let pos: f64 = conn
            .query_row("SELECT posinfif('x', 'x')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pos, f64::INFINITY);

        let finite: f64 = conn
            .query_row("SELECT ifnanorinf(1e999, 42.0)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(finite, 42.0);
        let none: Option<f64> = conn
            .query_row("SELECT ifinf(1e999)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn text_helpers() {
        let conn = connection();

        let encoded: String = conn
            .query_row("SELECT base64('hi')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(encoded, "aGk=");
        let decoded: String = conn
            .query_row("SELECT base64_decode('aGk=')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(decoded, "hi");

        let found: i64 = conn
            .query_row("SELECT contains('haystack', 'stack')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(found, 1);

        let matched: i64 = conn
            .query_row("SELECT regexp_like('hello42', '[a-z]+[0-9]+')", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(matched, 1);
        assert!(conn
            .query_row("SELECT regexp_like('x', '[')", [], |row| row.get::<_, i64>(0))
            .is_err());

        let id: String = conn
            .query_row("SELECT uuid()", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn math_functions() {
        let conn = connection();
        let get = |sql: &str| -> f64 { conn.query_row(sql, [], |row| row.get(0)).unwrap() };

        assert_eq!(get("SELECT abs(-3.5)"), 3.5);
        assert_eq!(get("SELECT ceil(1.2)"), 2.0);
        assert_eq!(get("SELECT floor(1.8)"), 1.0);
        assert_eq!(get("SELECT power(2, 10)"), 1024.0);
        assert!((get("SELECT pi()") - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(get("SELECT round(2.567, 2)"), 2.57);
        assert_eq!(get("SELECT trunc(2.567, 2)"), 2.56);
        assert_eq!(get("SELECT trunc(-1.7)"), -1.0);

        let sign: i64 = conn
            .query_row("SELECT sign(-9)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sign, -1);

        // Numbers arrive as encoded blobs from nested expressions too.
        let body = doc(serde_json::json!({"n": 16}));
        let root: f64 = conn
            .query_row("SELECT sqrt(fl_value(?1, 'n'))", params![body], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(root, 4.0);
    }

    #[test]
    fn deleted_revision_reads_as_empty_doc() {
        let conn = connection();
        let empty: Vec<u8> = Vec::new();
        let exists: i64 = conn
            .query_row("SELECT fl_exists(?1, 'x')", params![empty], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(exists, 0);
    }
}
