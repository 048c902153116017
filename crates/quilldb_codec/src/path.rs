//! Property-path expressions over value trees.

use crate::error::{CodecError, CodecResult};
use crate::shared_keys::SharedKeys;
use crate::value::Value;

/// One step of a compiled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Dictionary lookup by property name.
    Key(String),
    /// Array index; negative counts from the end.
    Index(i64),
}

/// A compiled property path.
///
/// Syntax: `a.b[0].c`. A leading `$.` (or bare `$`) refers to the root and
/// is skipped. Dots and brackets inside property names can be escaped with
/// a backslash. Negative indexes address from the back of an array, so
/// `items[-1]` is the last element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// Parses a path expression.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidPath`] on malformed bracket expressions
    /// or dangling escapes.
    pub fn parse(expr: &str) -> CodecResult<Self> {
        let mut rest = expr;
        if let Some(stripped) = rest.strip_prefix('$') {
            rest = stripped.strip_prefix('.').unwrap_or(stripped);
        }

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();
        let mut current = String::new();

        let flush = |current: &mut String, segments: &mut Vec<Segment>| {
            if !current.is_empty() {
                segments.push(Segment::Key(std::mem::take(current)));
            }
        };

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(CodecError::invalid_path("dangling escape")),
                },
                '.' => flush(&mut current, &mut segments),
                '[' => {
                    flush(&mut current, &mut segments);
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() || d == '-' => digits.push(d),
                            Some(_) | None => {
                                return Err(CodecError::invalid_path("unterminated index"))
                            }
                        }
                    }
                    let index = digits
                        .parse::<i64>()
                        .map_err(|_| CodecError::invalid_path("bad array index"))?;
                    segments.push(Segment::Index(index));
                }
                _ => current.push(c),
            }
        }
        flush(&mut current, &mut segments);

        Ok(Self { segments })
    }

    /// The compiled segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Evaluates this path against a root value.
    ///
    /// Returns `None` when the path does not reach a value ("missing"),
    /// which callers must distinguish from reaching an explicit
    /// [`Value::Null`]. Integer dictionary keys are resolved through
    /// `shared`, matching how the encoder interned them.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn eval<'v>(&self, root: &'v Value, shared: Option<&SharedKeys>) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(name) => current.get_with_keys(name, shared)?,
                Segment::Index(i) => {
                    let arr = current.as_array()?;
                    let index = if *i < 0 {
                        let from_end = (-*i) as usize;
                        arr.len().checked_sub(from_end)?
                    } else {
                        *i as usize
                    };
                    arr.get(index)?
                }
            };
        }
        Some(current)
    }
}

/// Parses and evaluates `expr` in one step.
pub fn eval_path<'v>(
    expr: &str,
    root: &'v Value,
    shared: Option<&SharedKeys>,
) -> CodecResult<Option<&'v Value>> {
    Ok(Path::parse(expr)?.eval(root, shared))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::map_from(vec![
            (
                "address",
                Value::map_from(vec![("city", Value::Text("Oslo".into()))]),
            ),
            (
                "tags",
                Value::Array(vec![
                    Value::Text("a".into()),
                    Value::Text("b".into()),
                    Value::Text("c".into()),
                ]),
            ),
            ("nil", Value::Null),
        ])
    }

    #[test]
    fn parse_segments() {
        let path = Path::parse("a.b[2].c").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(2),
                Segment::Key("c".into()),
            ]
        );
    }

    #[test]
    fn dollar_prefix_is_root() {
        assert_eq!(Path::parse("$.a").unwrap(), Path::parse("a").unwrap());
        let root = sample();
        let path = Path::parse("$").unwrap();
        assert_eq!(path.eval(&root, None), Some(&root));
    }

    #[test]
    fn eval_nested_key() {
        let root = sample();
        let v = eval_path("address.city", &root, None).unwrap();
        assert_eq!(v.unwrap().as_text(), Some("Oslo"));
    }

    #[test]
    fn eval_array_index() {
        let root = sample();
        assert_eq!(
            eval_path("tags[1]", &root, None).unwrap().unwrap().as_text(),
            Some("b")
        );
        assert_eq!(
            eval_path("tags[-1]", &root, None)
                .unwrap()
                .unwrap()
                .as_text(),
            Some("c")
        );
        assert!(eval_path("tags[9]", &root, None).unwrap().is_none());
    }

    #[test]
    fn missing_vs_null() {
        let root = sample();
        assert_eq!(eval_path("nil", &root, None).unwrap(), Some(&Value::Null));
        assert_eq!(eval_path("nope", &root, None).unwrap(), None);
    }

    #[test]
    fn escaped_dot_in_key() {
        let root = Value::map_from(vec![("a.b", Value::Integer(7))]);
        let v = eval_path("a\\.b", &root, None).unwrap();
        assert_eq!(v.unwrap().as_integer(), Some(7));
    }

    #[test]
    fn malformed_paths() {
        assert!(Path::parse("a[").is_err());
        assert!(Path::parse("a[x]").is_err());
        assert!(Path::parse("a\\").is_err());
    }

    #[test]
    fn eval_with_shared_keys() {
        let mut sk = SharedKeys::new();
        let id = sk.intern("city").unwrap();
        let root = Value::Map(vec![(
            Value::Integer(i64::from(id)),
            Value::Text("Oslo".into()),
        )]);
        let v = eval_path("city", &root, Some(&sk)).unwrap();
        assert_eq!(v.unwrap().as_text(), Some("Oslo"));
    }
}
