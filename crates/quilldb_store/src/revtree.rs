//! Per-document revision trees.

use crate::error::{StoreError, StoreResult};
use crate::revid::RevId;
use std::collections::HashMap;

/// Upper bound on ancestor IDs returned to a peer for delta negotiation.
pub const MAX_POSSIBLE_ANCESTORS: usize = 10;

/// Flags carried by a revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevFlags {
    /// The revision is a deletion tombstone.
    pub deleted: bool,
    /// The revision arrived via replication rather than a local write.
    pub foreign: bool,
    /// The body references attachments in the blob store.
    pub has_attachments: bool,
}

/// One revision in a tree.
#[derive(Debug, Clone)]
pub struct RevNode {
    /// This revision's ID.
    pub rev_id: RevId,
    /// Index of the parent node, if any.
    pub parent: Option<usize>,
    /// Revision flags.
    pub flags: RevFlags,
    /// The encoded body, kept for leaves.
    pub body: Option<Vec<u8>>,
}

/// Outcome of inserting a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The revision was already in the tree; nothing changed.
    AlreadyPresent,
    /// The revision was added.
    Inserted {
        /// True if the insert created or extended a conflicting branch.
        conflict: bool,
    },
}

/// The DAG of a document's revisions.
///
/// Leaves are the unresolved tips. Inserting an already-known revision is a
/// no-op, which is what makes replication re-sends harmless. History-based
/// insertion grafts a foreign chain onto the deepest locally-known
/// ancestor; with no common ancestor the chain becomes a parallel root
/// branch, i.e. a conflict.
#[derive(Debug, Clone, Default)]
pub struct RevisionTree {
    nodes: Vec<RevNode>,
    remote_ancestors: HashMap<u64, RevId>,
}

impl RevisionTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the tree has no revisions.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if `rev_id` is in the tree.
    pub fn contains(&self, rev_id: &RevId) -> bool {
        self.index_of(rev_id).is_some()
    }

    /// Returns the node for `rev_id`.
    pub fn node(&self, rev_id: &RevId) -> Option<&RevNode> {
        self.index_of(rev_id).map(|i| &self.nodes[i])
    }

    /// Inserts a revision with its ancestor history (descending generation,
    /// nearest first, excluding the revision itself).
    ///
    /// `allow_conflict` permits creating a new leaf branch; without it a
    /// conflicting insert fails. Forced insertion after a generation
    /// mismatch is the same call with `allow_conflict` set.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when the insert would branch and
    /// `allow_conflict` is false; [`StoreError::InvalidHistory`] when the
    /// history generations do not descend properly.
    pub fn insert(
        &mut self,
        doc_id: &str,
        rev_id: &RevId,
        history: &[RevId],
        body: Vec<u8>,
        flags: RevFlags,
        allow_conflict: bool,
    ) -> StoreResult<InsertOutcome> {
        if self.contains(rev_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let mut expected_gen = rev_id.generation();
        for ancestor in history {
            if ancestor.generation() >= expected_gen {
                return Err(StoreError::invalid_history(
                    doc_id,
                    "ancestor generations must descend",
                ));
            }
            expected_gen = ancestor.generation();
        }

        // Graft point: the deepest history entry already in the tree.
        let (graft_parent, start) = match history
            .iter()
            .enumerate()
            .find(|(_, ancestor)| self.contains(ancestor))
        {
            Some((i, ancestor)) => (self.index_of(ancestor), i),
            None => (None, history.len()),
        };

        let branching = match graft_parent {
            Some(parent) => !self.is_leaf_index(parent),
            // A parallel root is a conflict unless the tree is empty.
            None => !self.nodes.is_empty(),
        };
        if branching && !allow_conflict {
            return Err(StoreError::conflict(doc_id, rev_id.to_string()));
        }

        // Materialize the unknown tail of the history, oldest first, then
        // the revision itself.
        let mut parent = graft_parent;
        for ancestor in history[..start].iter().rev() {
            self.nodes.push(RevNode {
                rev_id: ancestor.clone(),
                parent,
                flags: RevFlags {
                    foreign: flags.foreign,
                    ..RevFlags::default()
                },
                body: None,
            });
            parent = Some(self.nodes.len() - 1);
        }
        self.nodes.push(RevNode {
            rev_id: rev_id.clone(),
            parent,
            flags,
            body: Some(body),
        });

        // Ancestors of the new leaf no longer need bodies.
        let mut cursor = parent;
        while let Some(i) = cursor {
            self.nodes[i].body = None;
            cursor = self.nodes[i].parent;
        }

        Ok(InsertOutcome::Inserted {
            conflict: branching,
        })
    }

    /// All leaf revisions (nodes with no children).
    pub fn leaves(&self) -> Vec<&RevNode> {
        let mut has_child = vec![false; self.nodes.len()];
        for node in &self.nodes {
            if let Some(p) = node.parent {
                has_child[p] = true;
            }
        }
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !has_child[*i])
            .map(|(_, n)| n)
            .collect()
    }

    /// The winning revision: non-deleted leaves beat tombstones, then
    /// highest (generation, digest) wins.
    pub fn winner(&self) -> Option<&RevNode> {
        let leaves = self.leaves();
        leaves
            .iter()
            .filter(|n| !n.flags.deleted)
            .max_by(|a, b| a.rev_id.cmp(&b.rev_id))
            .or_else(|| leaves.iter().max_by(|a, b| a.rev_id.cmp(&b.rev_id)))
            .copied()
    }

    /// True if more than one leaf is alive.
    pub fn is_conflicted(&self) -> bool {
        self.leaves().iter().filter(|n| !n.flags.deleted).count() > 1
    }

    /// Known revisions older than `rev_id`, descending by generation,
    /// capped at [`MAX_POSSIBLE_ANCESTORS`]. Sent to a peer so it can ship
    /// a smaller delta.
    pub fn find_ancestors(&self, rev_id: &RevId) -> Vec<RevId> {
        let mut candidates: Vec<&RevId> = self
            .nodes
            .iter()
            .map(|n| &n.rev_id)
            .filter(|r| r.generation() < rev_id.generation())
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));
        candidates
            .into_iter()
            .take(MAX_POSSIBLE_ANCESTORS)
            .cloned()
            .collect()
    }

    /// The latest revision known to be on the given remote.
    pub fn remote_ancestor(&self, remote_id: u64) -> Option<&RevId> {
        self.remote_ancestors.get(&remote_id)
    }

    /// Records that the given remote has `rev_id`.
    pub fn set_remote_ancestor(&mut self, remote_id: u64, rev_id: RevId) {
        self.remote_ancestors.insert(remote_id, rev_id);
    }

    fn index_of(&self, rev_id: &RevId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.rev_id == rev_id)
    }

    fn is_leaf_index(&self, index: usize) -> bool {
        !self.nodes.iter().any(|n| n.parent == Some(index))
    }
}
