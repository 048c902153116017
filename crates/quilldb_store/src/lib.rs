//! # QuillDB Store
//!
//! The storage collaborator of the replicator: documents with revision
//! trees, sequence-ordered change enumeration, a raw-document namespace
//! for replication metadata, per-remote ancestor markers, and a
//! content-addressed blob store.
//!
//! The surface here is deliberately narrow — exactly the operations the
//! replicator invokes. Storage is in-memory behind one mutex; a batch
//! insert is a single lock hold, the analogue of one write transaction.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod error;
mod revid;
mod revtree;
mod store;

pub use blob::{BlobKey, BlobStore};
pub use error::{StoreError, StoreResult};
pub use revid::RevId;
pub use revtree::{InsertOutcome, RevFlags, RevNode, RevisionTree, MAX_POSSIBLE_ANCESTORS};
pub use store::{ChangeEntry, DocumentInfo, DocumentStore, EnumerateOptions, RevInsert};
