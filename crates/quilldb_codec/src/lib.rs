//! # QuillDB Codec
//!
//! The binary document encoding for QuillDB: a canonical, self-describing
//! tree format with typed access, a shared property-key dictionary, and a
//! property-path evaluator.
//!
//! Determinism is the load-bearing property: identical trees encode to
//! identical bytes, so revision digests and checkpoint keys are stable
//! across platforms.
//!
//! ## Usage
//!
//! ```
//! use quilldb_codec::{decode, encode, eval_path, Value};
//!
//! let doc = Value::map_from(vec![("city", Value::Text("Oslo".into()))]);
//! let bytes = encode(&doc);
//!
//! let root = decode(&bytes).unwrap();
//! let city = eval_path("city", &root, None).unwrap();
//! assert_eq!(city.unwrap().as_text(), Some("Oslo"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
pub mod json;
mod path;
mod shared_keys;
mod value;

pub use decoder::{decode, Decoder};
pub use encoder::{encode, encode_with_keys, Encoder};
pub use error::{CodecError, CodecResult};
pub use path::{eval_path, Path, Segment};
pub use shared_keys::SharedKeys;
pub use value::{Value, ValueType};
