//! # QuillDB Query Bridge
//!
//! Host-function extensions for SQLite that evaluate property paths and
//! scalar/aggregate functions directly against encoded document bodies
//! stored in blobs, so the SQL layer can index and filter without first
//! materializing documents to JSON.
//!
//! ## Null versus missing
//!
//! SQL NULL means "no value at this path". An explicit null inside a
//! document is a different thing, and is represented as a zero-length
//! blob. `fl_value(body, 'x')` on `{"x": null}` returns the empty blob;
//! on `{}` it returns NULL.
//!
//! ## Usage
//!
//! ```no_run
//! use quilldb_query::register_functions;
//! use rusqlite::Connection;
//!
//! let conn = Connection::open_in_memory().unwrap();
//! register_functions(&conn, None, None).unwrap();
//! // SELECT fl_value(body, 'address.city') FROM docs ...
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod functions;
mod param;
mod result;

pub use error::{QueryError, QueryResult};
pub use functions::register_functions;
pub use param::BodyAccessor;
