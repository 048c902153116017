//! Shared replicator data types.

use crate::error::{ReplError, ReplResult};
use quilldb_store::RevId;

/// Callback invoked once a revision's insert transaction commits (or
/// fails).
pub type InsertCallback = Box<dyn FnOnce(ReplResult<()>) + Send>;

/// An inbound revision waiting to be committed.
///
/// Created when a `rev` message arrives, buffered by the insert batcher,
/// and consumed when its transaction commits. The completion callback
/// tells the puller whether the cursor may advance.
pub struct RevToInsert {
    /// Document ID.
    pub doc_id: String,
    /// The revision being inserted.
    pub rev_id: RevId,
    /// Ancestor revision IDs, descending generation.
    pub history: Vec<RevId>,
    /// Encoded body.
    pub body: Vec<u8>,
    /// True for a tombstone.
    pub deleted: bool,
    /// True if the body references attachments.
    pub has_attachments: bool,
    /// Fail instead of creating a conflict branch.
    pub no_conflicts: bool,
    /// The peer's cursor value for this revision.
    pub remote_sequence: Option<String>,
    /// Completion callback, invoked exactly once.
    pub on_complete: Option<InsertCallback>,
}

impl RevToInsert {
    /// Invokes the completion callback, if still present.
    pub fn complete(&mut self, result: ReplResult<()>) {
        if let Some(callback) = self.on_complete.take() {
            callback(result);
        }
    }
}

impl std::fmt::Debug for RevToInsert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevToInsert")
            .field("doc_id", &self.doc_id)
            .field("rev_id", &self.rev_id)
            .field("deleted", &self.deleted)
            .field("remote_sequence", &self.remote_sequence)
            .finish_non_exhaustive()
    }
}

/// An outbound revision the peer asked for.
#[derive(Debug, Clone)]
pub struct RevRequest {
    /// Document ID.
    pub doc_id: String,
    /// The revision to send.
    pub rev_id: RevId,
    /// Local sequence of the change entry, for checkpoint accounting.
    pub sequence: u64,
    /// Revision IDs the peer already has, from its changes reply.
    pub known_ancestors: Vec<String>,
    /// True for a tombstone.
    pub deleted: bool,
}

/// A per-document error surfaced through status, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct DocError {
    /// The document the error applies to.
    pub doc_id: String,
    /// True if the error happened while pushing, false while pulling.
    pub pushing: bool,
    /// The error itself.
    pub error: ReplError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_fires_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut rev = RevToInsert {
            doc_id: "a".into(),
            rev_id: "1-x".parse().unwrap(),
            history: vec![],
            body: vec![],
            deleted: false,
            has_attachments: false,
            no_conflicts: false,
            remote_sequence: None,
            on_complete: Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        };

        rev.complete(Ok(()));
        rev.complete(Err(ReplError::Cancelled));

        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert!(rx.try_recv().is_err());
    }
}
