//! Error types for the query bridge.

use thiserror::Error;

/// Result type for query-bridge operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors surfaced to the SQL engine from host functions.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The first argument was not a decodable document blob.
    #[error("invalid document argument: {0}")]
    InvalidDocument(String),

    /// The path argument failed to parse.
    #[error("path error: {0}")]
    Path(#[from] quilldb_codec::CodecError),

    /// A numeric function received a non-numeric argument.
    #[error("invalid numeric value")]
    NotNumeric,

    /// A regular expression failed to compile.
    #[error("invalid regular expression: {0}")]
    Regex(String),

    /// A function was called with too few arguments.
    #[error("too few arguments for {function}")]
    Arity {
        /// The offending function name.
        function: &'static str,
    },
}

impl From<QueryError> for rusqlite::Error {
    fn from(error: QueryError) -> Self {
        rusqlite::Error::UserFunctionError(Box::new(error))
    }
}
