//! Error types for the document store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A revision could not be inserted without creating a conflict the
    /// caller forbade.
    #[error("document conflict on {doc_id} at {rev_id}")]
    Conflict {
        /// The conflicting document.
        doc_id: String,
        /// The revision that could not be inserted.
        rev_id: String,
    },

    /// Document not found.
    #[error("document not found: {doc_id}")]
    NotFound {
        /// The document ID that was not found.
        doc_id: String,
    },

    /// Revision not found in the document's tree.
    #[error("revision {rev_id} not found in {doc_id}")]
    RevNotFound {
        /// The document searched.
        doc_id: String,
        /// The revision ID that was not found.
        rev_id: String,
    },

    /// A revision ID failed to parse.
    #[error("invalid revision ID: {input}")]
    InvalidRevId {
        /// The malformed input.
        input: String,
    },

    /// A revision's history is inconsistent with its generation.
    #[error("invalid revision history for {doc_id}: {message}")]
    InvalidHistory {
        /// The document the history belongs to.
        doc_id: String,
        /// Description of the inconsistency.
        message: String,
    },

    /// Blob not found in the content store.
    #[error("blob not found: {key}")]
    BlobNotFound {
        /// The missing blob key.
        key: String,
    },

    /// A blob key string failed to parse.
    #[error("invalid blob key: {input}")]
    InvalidBlobKey {
        /// The malformed input.
        input: String,
    },
}

impl StoreError {
    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(doc_id: impl Into<String>) -> Self {
        Self::NotFound {
            doc_id: doc_id.into(),
        }
    }

    /// Creates an invalid-history error.
    pub fn invalid_history(doc_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidHistory {
            doc_id: doc_id.into(),
            message: message.into(),
        }
    }
}
