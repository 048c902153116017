//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Failed to decode document bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Invalid encoded structure.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// Invalid property path expression.
    #[error("invalid path: {message}")]
    InvalidPath {
        /// Description of the path error.
        message: String,
    },

    /// Shared-key dictionary is full or the key is not eligible.
    #[error("shared key rejected: {key}")]
    SharedKeyRejected {
        /// The offending key.
        key: String,
    },
}

impl CodecError {
    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Creates an invalid path error.
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            message: message.into(),
        }
    }
}
