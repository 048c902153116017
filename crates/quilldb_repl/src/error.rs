//! Error types for the replicator.

use thiserror::Error;

/// Result type for replicator operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Authentication failed; replication stops.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local and remote checkpoints disagree; the session resets.
    #[error("checkpoint mismatch, resetting")]
    CheckpointMismatch,

    /// A revision could not be applied because of a conflict. Reported
    /// per document, never fatal to the session.
    #[error("conflict on document {doc_id} at {rev_id}")]
    DocumentConflict {
        /// The conflicting document.
        doc_id: String,
        /// The revision that conflicted.
        rev_id: String,
    },

    /// The peer sent a message we cannot parse. Protocol-fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reply from the peer.
    #[error("remote error {domain}/{code}: {message}")]
    Remote {
        /// Error domain reported by the peer.
        domain: String,
        /// Numeric code (HTTP-style for the web domain).
        code: i32,
        /// Human-readable message.
        message: String,
    },

    /// Local database failure; replication stops.
    #[error("store error: {0}")]
    Store(#[from] quilldb_store::StoreError),

    /// Document encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] quilldb_codec::CodecError),

    /// A Set-Cookie header failed to parse or validate.
    #[error("invalid cookie: {0}")]
    InvalidCookie(String),

    /// The operation was cancelled. Not a failure.
    #[error("replication cancelled")]
    Cancelled,
}

impl ReplError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a remote error.
    pub fn remote(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::Remote {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// True if retrying with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplError::Transport { retryable, .. } => *retryable,
            ReplError::Remote { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// True if the error applies to a single document rather than the
    /// whole session.
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            ReplError::DocumentConflict { .. }
                | ReplError::Remote {
                    code: 403 | 404 | 409,
                    ..
                }
        )
    }

    /// True if the error must terminate the replicator.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient() && !self.is_document_error() && *self != ReplError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ReplError::transport_retryable("reset").is_transient());
        assert!(!ReplError::transport_fatal("bad cert").is_transient());
        assert!(ReplError::remote("web", 503, "busy").is_transient());
        assert!(!ReplError::remote("web", 401, "no").is_transient());
    }

    #[test]
    fn document_errors_are_not_fatal() {
        let conflict = ReplError::DocumentConflict {
            doc_id: "a".into(),
            rev_id: "1-x".into(),
        };
        assert!(conflict.is_document_error());
        assert!(!conflict.is_fatal());

        assert!(ReplError::remote("web", 409, "conflict").is_document_error());
    }

    #[test]
    fn fatal_classification() {
        assert!(ReplError::Auth("denied".into()).is_fatal());
        assert!(ReplError::protocol("garbage").is_fatal());
        assert!(!ReplError::Cancelled.is_fatal());
        assert!(!ReplError::transport_retryable("link flap").is_fatal());
    }
}
