//! The document store: the narrow surface the replicator drives.

use crate::error::{StoreError, StoreResult};
use crate::revid::RevId;
use crate::revtree::{InsertOutcome, RevFlags, RevisionTree};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};

/// One entry from the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Commit sequence, unique and monotonically increasing.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Tip revision at this sequence.
    pub rev_id: RevId,
    /// True if the tip is a tombstone.
    pub deleted: bool,
    /// Encoded body size in bytes.
    pub body_size: usize,
}

/// Filters for change enumeration.
#[derive(Debug, Clone, Default)]
pub struct EnumerateOptions {
    /// Maximum entries to return; 0 means unlimited.
    pub limit: usize,
    /// Skip documents whose tip is deleted.
    pub skip_deleted: bool,
    /// Skip documents whose tip arrived via replication.
    pub skip_foreign: bool,
    /// Restrict to this set of document IDs.
    pub doc_ids: Option<HashSet<String>>,
}

/// A snapshot of one document's current state.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    /// Document ID.
    pub doc_id: String,
    /// Winning revision.
    pub rev_id: RevId,
    /// Sequence of the latest change to this document.
    pub sequence: u64,
    /// True if the winner is a tombstone.
    pub deleted: bool,
    /// True if more than one live leaf exists.
    pub conflicted: bool,
    /// Encoded body of the winner, if retained.
    pub body: Option<Vec<u8>>,
}

/// A foreign revision to insert as part of a batch.
#[derive(Debug, Clone)]
pub struct RevInsert {
    /// Document ID.
    pub doc_id: String,
    /// The revision being inserted.
    pub rev_id: RevId,
    /// Ancestor IDs, descending generation, nearest first.
    pub history: Vec<RevId>,
    /// Encoded body.
    pub body: Vec<u8>,
    /// True for a tombstone.
    pub deleted: bool,
    /// True if the body references blobs.
    pub has_attachments: bool,
    /// Refuse the insert rather than create a conflict branch.
    pub no_conflicts: bool,
    /// Remote the revision came from; records the per-remote ancestor
    /// marker so push never ships it back.
    pub remote_id: Option<u64>,
}

struct DocRecord {
    tree: RevisionTree,
    sequence: u64,
}

struct Inner {
    docs: HashMap<String, DocRecord>,
    by_seq: BTreeMap<u64, String>,
    last_sequence: u64,
    raw: HashMap<(String, String), Vec<u8>>,
    observers: Vec<Sender<u64>>,
}

/// An in-memory document store with revision trees.
///
/// All state sits behind one mutex; a batch insert is one lock hold, which
/// is the in-memory analogue of a single write transaction. Observers get
/// one notification per commit carrying the new last sequence.
pub struct DocumentStore {
    uuid: [u8; 16],
    inner: Mutex<Inner>,
}

impl DocumentStore {
    /// Creates an empty store with a fresh UUID.
    pub fn new() -> Self {
        let mut uuid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid);
        Self {
            uuid,
            inner: Mutex::new(Inner {
                docs: HashMap::new(),
                by_seq: BTreeMap::new(),
                last_sequence: 0,
                raw: HashMap::new(),
                observers: Vec::new(),
            }),
        }
    }

    /// The store's stable UUID, part of the checkpoint key.
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// The highest committed sequence.
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().last_sequence
    }

    /// True if nothing has ever been committed.
    pub fn is_empty(&self) -> bool {
        self.last_sequence() == 0
    }

    /// Subscribes to commit notifications.
    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = mpsc::channel();
        self.inner.lock().observers.push(tx);
        rx
    }

    /// Writes a new local revision of `doc_id` on top of the current
    /// winner. Returns the new revision ID and sequence.
    pub fn put(&self, doc_id: &str, body: Vec<u8>, deleted: bool) -> StoreResult<(RevId, u64)> {
        let mut inner = self.inner.lock();
        let record = inner.docs.entry(doc_id.to_string()).or_insert_with(|| DocRecord {
            tree: RevisionTree::new(),
            sequence: 0,
        });

        let parent = record.tree.winner().map(|n| n.rev_id.clone());
        let rev_id = RevId::derive(parent.as_ref(), &body, deleted);
        let history: Vec<RevId> = parent.into_iter().collect();
        record.tree.insert(
            doc_id,
            &rev_id,
            &history,
            body,
            RevFlags {
                deleted,
                ..RevFlags::default()
            },
            false,
        )?;

        let sequence = Self::bump_sequence(&mut inner, doc_id);
        let last = inner.last_sequence;
        Self::notify(&mut inner, last);
        Ok((rev_id, sequence))
    }

    /// Reads a document's current state.
    pub fn get(&self, doc_id: &str) -> Option<DocumentInfo> {
        let inner = self.inner.lock();
        let record = inner.docs.get(doc_id)?;
        let winner = record.tree.winner()?;
        Some(DocumentInfo {
            doc_id: doc_id.to_string(),
            rev_id: winner.rev_id.clone(),
            sequence: record.sequence,
            deleted: winner.flags.deleted,
            conflicted: record.tree.is_conflicted(),
            body: winner.body.clone(),
        })
    }

    /// Reads the body of a specific revision, if retained.
    pub fn body_of(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Vec<u8>> {
        let inner = self.inner.lock();
        let record = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| StoreError::not_found(doc_id))?;
        let node = record
            .tree
            .node(rev_id)
            .ok_or_else(|| StoreError::RevNotFound {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
            })?;
        node.body.clone().ok_or_else(|| StoreError::RevNotFound {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
        })
    }

    /// Enumerates changes with sequence greater than `since`, in sequence
    /// order.
    pub fn changes_since(&self, since: u64, options: &EnumerateOptions) -> Vec<ChangeEntry> {
        let inner = self.inner.lock();
        let mut entries = Vec::new();
        for (&sequence, doc_id) in inner.by_seq.range(since + 1..) {
            if options.limit > 0 && entries.len() >= options.limit {
                break;
            }
            if let Some(ids) = &options.doc_ids {
                if !ids.contains(doc_id) {
                    continue;
                }
            }
            let Some(record) = inner.docs.get(doc_id) else {
                continue;
            };
            let Some(winner) = record.tree.winner() else {
                continue;
            };
            if options.skip_deleted && winner.flags.deleted {
                continue;
            }
            if options.skip_foreign && winner.flags.foreign {
                continue;
            }
            entries.push(ChangeEntry {
                sequence,
                doc_id: doc_id.clone(),
                rev_id: winner.rev_id.clone(),
                deleted: winner.flags.deleted,
                body_size: winner.body.as_ref().map_or(0, Vec::len),
            });
        }
        entries
    }

    /// Decides whether an announced revision is worth requesting: unknown
    /// to the tree and not older than what the remote already holds here.
    pub fn is_rev_wanted(&self, doc_id: &str, rev_id: &RevId, remote_id: Option<u64>) -> bool {
        let inner = self.inner.lock();
        let Some(record) = inner.docs.get(doc_id) else {
            return true;
        };
        if record.tree.contains(rev_id) {
            return false;
        }
        if let Some(remote) = remote_id {
            if let Some(marker) = record.tree.remote_ancestor(remote) {
                if rev_id.generation() < marker.generation() {
                    return false;
                }
            }
        }
        true
    }

    /// Known ancestors of an announced revision, for delta negotiation.
    pub fn find_ancestors(&self, doc_id: &str, rev_id: &RevId) -> Vec<RevId> {
        let inner = self.inner.lock();
        inner
            .docs
            .get(doc_id)
            .map(|record| record.tree.find_ancestors(rev_id))
            .unwrap_or_default()
    }

    /// Inserts a batch of foreign revisions in one commit.
    ///
    /// Per-revision outcomes come back in order; a conflict from a plain
    /// insert is retried forced unless the revision forbids conflicts.
    /// Successfully inserted revisions update their remote ancestor marker.
    /// One observer notification fires for the whole batch.
    pub fn insert_batch(&self, inserts: Vec<RevInsert>) -> Vec<StoreResult<u64>> {
        let mut inner = self.inner.lock();
        let mut results = Vec::with_capacity(inserts.len());

        for insert in inserts {
            let result = Self::insert_one(&mut inner, &insert);
            results.push(result);
        }

        let last = inner.last_sequence;
        Self::notify(&mut inner, last);
        results
    }

    /// Records that a remote holds `rev_id` of `doc_id`.
    pub fn set_remote_ancestor(&self, doc_id: &str, remote_id: u64, rev_id: RevId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.docs.get_mut(doc_id) {
            record.tree.set_remote_ancestor(remote_id, rev_id);
        }
    }

    /// The latest revision known to be on the given remote.
    pub fn remote_ancestor(&self, doc_id: &str, remote_id: u64) -> Option<RevId> {
        let inner = self.inner.lock();
        inner
            .docs
            .get(doc_id)
            .and_then(|r| r.tree.remote_ancestor(remote_id).cloned())
    }

    /// Reads a raw document from a reserved namespace.
    pub fn raw_get(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .raw
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    /// Writes a raw document into a reserved namespace. Raw documents never
    /// appear in the change feed and are never replicated.
    pub fn raw_put(&self, namespace: &str, key: &str, value: Vec<u8>) {
        self.inner
            .lock()
            .raw
            .insert((namespace.to_string(), key.to_string()), value);
    }

    fn insert_one(inner: &mut Inner, insert: &RevInsert) -> StoreResult<u64> {
        let record = inner
            .docs
            .entry(insert.doc_id.clone())
            .or_insert_with(|| DocRecord {
                tree: RevisionTree::new(),
                sequence: 0,
            });

        let flags = RevFlags {
            deleted: insert.deleted,
            foreign: true,
            has_attachments: insert.has_attachments,
        };

        let first = record.tree.insert(
            &insert.doc_id,
            &insert.rev_id,
            &insert.history,
            insert.body.clone(),
            flags,
            false,
        );
        let outcome = match first {
            Ok(outcome) => outcome,
            Err(StoreError::Conflict { .. }) if !insert.no_conflicts => {
                // Generation mismatch against the local tree; force the
                // branch and let the conflict surface to the application.
                record.tree.insert(
                    &insert.doc_id,
                    &insert.rev_id,
                    &insert.history,
                    insert.body.clone(),
                    flags,
                    true,
                )?
            }
            Err(err) => return Err(err),
        };

        if outcome == InsertOutcome::AlreadyPresent {
            if let Some(remote) = insert.remote_id {
                record
                    .tree
                    .set_remote_ancestor(remote, insert.rev_id.clone());
            }
            return Ok(record.sequence);
        }

        if let Some(remote) = insert.remote_id {
            record
                .tree
                .set_remote_ancestor(remote, insert.rev_id.clone());
        }
        Ok(Self::bump_sequence(inner, &insert.doc_id))
    }

    fn bump_sequence(inner: &mut Inner, doc_id: &str) -> u64 {
        inner.last_sequence += 1;
        let sequence = inner.last_sequence;
        if let Some(record) = inner.docs.get_mut(doc_id) {
            if record.sequence != 0 {
                inner.by_seq.remove(&record.sequence);
            }
            record.sequence = sequence;
        }
        inner.by_seq.insert(sequence, doc_id.to_string());
        sequence
    }

    fn notify(inner: &mut Inner, sequence: u64) {
        inner.observers.retain(|tx| tx.send(sequence).is_ok());
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn put_assigns_sequences() {
        let store = DocumentStore::new();
        assert!(store.is_empty());

        let (rev_a, seq_a) = store.put("a", b"{}".to_vec(), false).unwrap();
        let (_, seq_b) = store.put("b", b"{}".to_vec(), false).unwrap();
        assert_eq!(seq_a, 1);
        assert_eq!(seq_b, 2);
        assert_eq!(rev_a.generation(), 1);
        assert_eq!(store.last_sequence(), 2);
    }

    #[test]
    fn update_moves_sequence() {
        let store = DocumentStore::new();
        store.put("a", b"v1".to_vec(), false).unwrap();
        store.put("b", b"{}".to_vec(), false).unwrap();
        store.put("a", b"v2".to_vec(), false).unwrap();

        let changes = store.changes_since(0, &EnumerateOptions::default());
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].doc_id, "b");
        assert_eq!(changes[1].doc_id, "a");
        assert_eq!(changes[1].sequence, 3);
        assert_eq!(changes[1].rev_id.generation(), 2);
    }

    #[test]
    fn changes_since_filters() {
        let store = DocumentStore::new();
        store.put("a", b"{}".to_vec(), false).unwrap();
        store.put("gone", b"{}".to_vec(), true).unwrap();

        let all = store.changes_since(0, &EnumerateOptions::default());
        assert_eq!(all.len(), 2);

        let live = store.changes_since(
            0,
            &EnumerateOptions {
                skip_deleted: true,
                ..EnumerateOptions::default()
            },
        );
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].doc_id, "a");

        let filtered = store.changes_since(
            0,
            &EnumerateOptions {
                doc_ids: Some(["gone".to_string()].into()),
                ..EnumerateOptions::default()
            },
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].doc_id, "gone");
    }

    #[test]
    fn changes_since_limit() {
        let store = DocumentStore::new();
        for i in 0..5 {
            store.put(&format!("d{i}"), b"{}".to_vec(), false).unwrap();
        }
        let limited = store.changes_since(
            0,
            &EnumerateOptions {
                limit: 2,
                ..EnumerateOptions::default()
            },
        );
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].sequence, 1);
    }

    #[test]
    fn foreign_inserts_are_skippable() {
        let store = DocumentStore::new();
        store.put("local", b"{}".to_vec(), false).unwrap();
        let results = store.insert_batch(vec![RevInsert {
            doc_id: "remote".into(),
            rev_id: rev("1-abc"),
            history: vec![],
            body: b"{}".to_vec(),
            deleted: false,
            has_attachments: false,
            no_conflicts: false,
            remote_id: Some(1),
        }]);
        assert!(results[0].is_ok());

        let local_only = store.changes_since(
            0,
            &EnumerateOptions {
                skip_foreign: true,
                ..EnumerateOptions::default()
            },
        );
        assert_eq!(local_only.len(), 1);
        assert_eq!(local_only[0].doc_id, "local");
        assert_eq!(store.remote_ancestor("remote", 1), Some(rev("1-abc")));
    }

    #[test]
    fn conflicting_insert_is_forced() {
        let store = DocumentStore::new();
        store.put("a", b"mine".to_vec(), false).unwrap();

        let results = store.insert_batch(vec![RevInsert {
            doc_id: "a".into(),
            rev_id: rev("1-theirs"),
            history: vec![],
            body: b"theirs".to_vec(),
            deleted: false,
            has_attachments: false,
            no_conflicts: false,
            remote_id: None,
        }]);
        assert!(results[0].is_ok());
        assert!(store.get("a").unwrap().conflicted);
    }

    #[test]
    fn no_conflicts_insert_fails_instead() {
        let store = DocumentStore::new();
        store.put("a", b"mine".to_vec(), false).unwrap();

        let results = store.insert_batch(vec![RevInsert {
            doc_id: "a".into(),
            rev_id: rev("1-theirs"),
            history: vec![],
            body: b"theirs".to_vec(),
            deleted: false,
            has_attachments: false,
            no_conflicts: true,
            remote_id: None,
        }]);
        assert!(matches!(results[0], Err(StoreError::Conflict { .. })));
        assert!(!store.get("a").unwrap().conflicted);
    }

    #[test]
    fn reinserted_rev_keeps_sequence() {
        let store = DocumentStore::new();
        let insert = RevInsert {
            doc_id: "a".into(),
            rev_id: rev("1-abc"),
            history: vec![],
            body: b"{}".to_vec(),
            deleted: false,
            has_attachments: false,
            no_conflicts: false,
            remote_id: None,
        };
        store.insert_batch(vec![insert.clone()]);
        let before = store.last_sequence();
        store.insert_batch(vec![insert]);
        assert_eq!(store.last_sequence(), before);
    }

    #[test]
    fn rev_wanted_logic() {
        let store = DocumentStore::new();
        assert!(store.is_rev_wanted("new", &rev("1-x"), None));

        let (rev_id, _) = store.put("a", b"{}".to_vec(), false).unwrap();
        assert!(!store.is_rev_wanted("a", &rev_id, None));
        assert!(store.is_rev_wanted("a", &rev("2-future"), None));

        store.set_remote_ancestor("a", 1, rev("5-far"));
        assert!(!store.is_rev_wanted("a", &rev("2-stale"), Some(1)));
        assert!(store.is_rev_wanted("a", &rev("6-new"), Some(1)));
    }

    #[test]
    fn raw_documents_are_separate() {
        let store = DocumentStore::new();
        store.raw_put("checkpoints", "cp-1", b"state".to_vec());
        assert_eq!(store.raw_get("checkpoints", "cp-1"), Some(b"state".to_vec()));
        assert_eq!(store.raw_get("cookies", "cp-1"), None);
        assert!(store.is_empty());
        assert!(store.changes_since(0, &EnumerateOptions::default()).is_empty());
    }

    #[test]
    fn observers_notified_once_per_batch() {
        let store = DocumentStore::new();
        let rx = store.subscribe();

        store.insert_batch(vec![
            RevInsert {
                doc_id: "a".into(),
                rev_id: rev("1-a"),
                history: vec![],
                body: vec![],
                deleted: false,
                has_attachments: false,
                no_conflicts: false,
                remote_id: None,
            },
            RevInsert {
                doc_id: "b".into(),
                rev_id: rev("1-b"),
                history: vec![],
                body: vec![],
                deleted: false,
                has_attachments: false,
                no_conflicts: false,
                remote_id: None,
            },
        ]);

        assert_eq!(rx.recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }
}
