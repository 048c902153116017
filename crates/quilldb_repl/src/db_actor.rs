//! The database actor: exclusive owner of all store access.

use crate::batcher::{InsertBatcher, Nudge, INSERT_BATCH_DELAY};
use crate::checkpoint::{Checkpoint, CHECKPOINT_NAMESPACE};
use crate::cookies::CookieStore;
use crate::error::{ReplError, ReplResult};
use crate::message::{Message, Profile};
use crate::options::ReplicatorOptions;
use crate::puller::{AnnouncedRev, PullerHandle};
use crate::pusher::{PushChange, PusherHandle};
use crate::replicator::CoordHandle;
use crate::status::{ActivityLevel, ActorKind};
use crate::transport::{Inbound, Transport};
use crate::types::{RevRequest, RevToInsert};
use quilldb_codec::{decode, encode, Value};
use quilldb_store::{BlobStore, DocumentStore, EnumerateOptions, RevId, RevInsert, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, warn};

/// Reserved raw-document namespace for persisted cookies.
pub const COOKIE_NAMESPACE: &str = "cookies";

/// Callback delivering the local checkpoint read.
pub(crate) type CheckpointCallback = Box<dyn FnOnce(Option<Checkpoint>, bool) + Send>;

/// Mailbox messages for the database actor.
pub(crate) enum DbMessage {
    GetCheckpoint {
        key: String,
        reply: CheckpointCallback,
    },
    SetCheckpoint {
        key: String,
        checkpoint: Checkpoint,
    },
    GetChanges {
        since: u64,
    },
    DbChanged,
    FindOrRequestRevs {
        inbound: Inbound,
    },
    SendRevision {
        request: RevRequest,
    },
    MarkSynced {
        doc_id: String,
        rev_id: RevId,
    },
    SetCookie {
        header: String,
    },
    InsertNudge {
        flush_now: bool,
    },
    Stop,
}

/// Clonable handle to the database actor.
#[derive(Clone)]
pub(crate) struct DbHandle {
    tx: Sender<DbMessage>,
    batcher: Arc<InsertBatcher>,
}

impl DbHandle {
    pub(crate) fn get_checkpoint(&self, key: String, reply: CheckpointCallback) {
        let _ = self.tx.send(DbMessage::GetCheckpoint { key, reply });
    }

    pub(crate) fn set_checkpoint(&self, key: String, checkpoint: Checkpoint) {
        let _ = self.tx.send(DbMessage::SetCheckpoint { key, checkpoint });
    }

    pub(crate) fn get_changes(&self, since: u64) {
        let _ = self.tx.send(DbMessage::GetChanges { since });
    }

    pub(crate) fn find_or_request_revs(&self, inbound: Inbound) {
        let _ = self.tx.send(DbMessage::FindOrRequestRevs { inbound });
    }

    pub(crate) fn send_revision(&self, request: RevRequest) {
        let _ = self.tx.send(DbMessage::SendRevision { request });
    }

    pub(crate) fn set_cookie(&self, header: String) {
        let _ = self.tx.send(DbMessage::SetCookie { header });
    }

    /// Queues a revision for batched insertion. Callable from any actor;
    /// the queue lock is the only synchronization.
    pub(crate) fn insert_revision(&self, rev: RevToInsert) {
        let nudge = self.batcher.push(rev);
        let _ = self.tx.send(DbMessage::InsertNudge {
            flush_now: nudge == Nudge::FlushNow,
        });
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(DbMessage::Stop);
    }
}

/// Everything the database actor needs at spawn time.
pub(crate) struct DbActorContext {
    pub store: Arc<DocumentStore>,
    pub blobs: Arc<BlobStore>,
    pub transport: Arc<dyn Transport>,
    pub cookies: Arc<CookieStore>,
    pub options: ReplicatorOptions,
    pub remote_host: String,
    pub remote_url: String,
    pub coord: CoordHandle,
    pub pusher: PusherHandle,
    pub puller: PullerHandle,
}

/// Creates the database actor's mailbox ahead of spawning it, so that the
/// pusher and puller can hold its handle before the actor exists.
pub(crate) fn channel() -> (DbHandle, Receiver<DbMessage>) {
    let (tx, rx) = mpsc::channel();
    let handle = DbHandle {
        tx,
        batcher: Arc::new(InsertBatcher::new()),
    };
    (handle, rx)
}

/// Spawns the database actor thread on a mailbox from [`channel`].
pub(crate) fn spawn(
    ctx: DbActorContext,
    handle: &DbHandle,
    rx: Receiver<DbMessage>,
) -> JoinHandle<()> {
    let actor = DbActor {
        ctx,
        batcher: Arc::clone(&handle.batcher),
        self_tx: handle.tx.clone(),
        flush_deadline: None,
        push_since: 0,
        observer_armed: false,
        observer_stop: Arc::new(AtomicBool::new(false)),
        requested: HashSet::new(),
    };
    std::thread::Builder::new()
        .name("quilldb-db".to_string())
        .spawn(move || actor.run(rx))
        .expect("failed to spawn db actor thread")
}

struct DbActor {
    ctx: DbActorContext,
    batcher: Arc<InsertBatcher>,
    self_tx: Sender<DbMessage>,
    flush_deadline: Option<Instant>,
    push_since: u64,
    observer_armed: bool,
    observer_stop: Arc<AtomicBool>,
    requested: HashSet<(String, String)>,
}

impl DbActor {
    fn run(mut self, rx: Receiver<DbMessage>) {
        loop {
            let message = match self.flush_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            self.flush_deadline = None;
                            self.flush_inserts();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            match message {
                DbMessage::GetCheckpoint { key, reply } => self.handle_get_checkpoint(&key, reply),
                DbMessage::SetCheckpoint { key, checkpoint } => {
                    self.handle_set_checkpoint(&key, &checkpoint);
                }
                DbMessage::GetChanges { since } => self.handle_get_changes(since),
                DbMessage::DbChanged => self.handle_db_changed(),
                DbMessage::FindOrRequestRevs { inbound } => self.handle_find_or_request(inbound),
                DbMessage::SendRevision { request } => self.handle_send_revision(request),
                DbMessage::MarkSynced { doc_id, rev_id } => {
                    // The peer acknowledged this revision; push must never
                    // offer it again.
                    self.ctx.store.set_remote_ancestor(
                        &doc_id,
                        self.ctx.options.remote_id,
                        rev_id,
                    );
                }
                DbMessage::SetCookie { header } => self.handle_set_cookie(&header),
                DbMessage::InsertNudge { flush_now } => {
                    if flush_now {
                        self.flush_deadline = None;
                        self.flush_inserts();
                    } else if self.flush_deadline.is_none() {
                        self.flush_deadline = Some(Instant::now() + INSERT_BATCH_DELAY);
                    }
                }
                DbMessage::Stop => break,
            }
        }

        // Best-effort final flush, then persist cookies.
        self.flush_inserts();
        self.persist_cookies();
        self.observer_stop.store(true, Ordering::SeqCst);
        self.ctx
            .coord
            .actor_status(ActorKind::Db, ActivityLevel::Stopped);
    }

    fn handle_get_checkpoint(&self, key: &str, reply: CheckpointCallback) {
        let checkpoint = self
            .ctx
            .store
            .raw_get(CHECKPOINT_NAMESPACE, key)
            .and_then(|bytes| Checkpoint::from_bytes(&bytes).ok());
        reply(checkpoint, self.ctx.store.is_empty());
    }

    fn handle_set_checkpoint(&self, key: &str, checkpoint: &Checkpoint) {
        debug!(
            local_seq = checkpoint.local_seq,
            remote_cursor = %checkpoint.remote_cursor,
            "saving local checkpoint"
        );
        self.ctx
            .store
            .raw_put(CHECKPOINT_NAMESPACE, key, checkpoint.to_bytes());
    }

    fn handle_get_changes(&mut self, since: u64) {
        let options = EnumerateOptions {
            limit: self.ctx.options.changes_batch_size,
            skip_deleted: false,
            // In bidirectional sessions, do not echo back what we pulled.
            skip_foreign: self.ctx.options.pull.is_active(),
            doc_ids: self.ctx.options.doc_ids.clone(),
        };
        let entries = self.ctx.store.changes_since(since, &options);
        let more = entries.len() == self.ctx.options.changes_batch_size;
        if let Some(last) = entries.last() {
            self.push_since = self.push_since.max(last.sequence);
        } else {
            self.push_since = self.push_since.max(since);
        }

        let changes: Vec<PushChange> = entries
            .into_iter()
            .filter(|entry| {
                // Already on the remote: the per-remote marker says so.
                self.ctx
                    .store
                    .remote_ancestor(&entry.doc_id, self.ctx.options.remote_id)
                    .as_ref()
                    != Some(&entry.rev_id)
            })
            .map(|entry| {
                let remote_ancestor = self
                    .ctx
                    .store
                    .remote_ancestor(&entry.doc_id, self.ctx.options.remote_id)
                    .map(|r| r.to_string());
                PushChange {
                    entry,
                    remote_ancestor,
                }
            })
            .collect();

        debug!(count = changes.len(), since, more, "enumerated changes");
        self.ctx.pusher.changes(changes, more);

        if self.ctx.options.push.is_continuous() && !self.observer_armed {
            self.arm_observer();
        }
    }

    fn handle_db_changed(&mut self) {
        if !self.observer_armed {
            return;
        }
        let since = self.push_since;
        self.handle_get_changes(since);
    }

    fn arm_observer(&mut self) {
        self.observer_armed = true;
        let rx = self.ctx.store.subscribe();
        let tx = self.self_tx.clone();
        let stop = Arc::clone(&self.observer_stop);
        std::thread::Builder::new()
            .name("quilldb-db-observer".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(std::time::Duration::from_millis(250)) {
                    Ok(_) => {
                        if tx.send(DbMessage::DbChanged).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("failed to spawn change observer thread");
    }

    /// Answers a `changes` or `proposedChanges` announcement: which of
    /// these revisions do we want?
    fn handle_find_or_request(&mut self, inbound: Inbound) {
        match inbound.message.profile() {
            Profile::Changes => self.handle_changes_announcement(inbound),
            Profile::ProposedChanges => self.handle_proposed_announcement(inbound),
            _ => {
                if let Some(responder) = inbound.responder {
                    responder.respond(Message::error("proto", 501, "unsupported profile"));
                }
            }
        }
    }

    fn handle_changes_announcement(&mut self, inbound: Inbound) {
        let entries = match inbound.message.json_body() {
            Ok(serde_json::Value::Array(entries)) => entries,
            Ok(serde_json::Value::Null) => Vec::new(),
            Ok(_) | Err(_) => {
                self.ctx
                    .coord
                    .fatal(ReplError::protocol("malformed changes body"));
                return;
            }
        };

        if entries.is_empty() {
            self.ctx.puller.announced(Vec::new(), true);
            if let Some(responder) = inbound.responder {
                responder.respond(Message::reply());
            }
            return;
        }

        let mut response = Vec::with_capacity(entries.len());
        let mut announced = Vec::with_capacity(entries.len());
        for entry in &entries {
            let parsed = parse_change_entry(entry);
            let Some((sequence, doc_id, rev_id)) = parsed else {
                self.ctx
                    .coord
                    .fatal(ReplError::protocol("malformed changes entry"));
                return;
            };

            let slot = (doc_id.clone(), rev_id.to_string());
            let wanted = !self.requested.contains(&slot)
                && self
                    .ctx
                    .store
                    .is_rev_wanted(&doc_id, &rev_id, Some(self.ctx.options.remote_id));

            if wanted {
                // Suppress duplicate announcements of the same revision.
                self.requested.insert(slot);
                let ancestors: Vec<serde_json::Value> = self
                    .ctx
                    .store
                    .find_ancestors(&doc_id, &rev_id)
                    .into_iter()
                    .map(|r| serde_json::Value::String(r.to_string()))
                    .collect();
                response.push(serde_json::Value::Array(ancestors));
            } else {
                response.push(serde_json::Value::from(0));
            }
            announced.push(AnnouncedRev { sequence, wanted });
        }

        // Tell the puller before releasing the reply: the peer starts
        // sending revisions the moment it sees the wanted mask, and the
        // puller must already know the announcement order by then.
        self.ctx.puller.announced(announced, false);
        if let Some(responder) = inbound.responder {
            responder.respond(Message::reply().with_json(&serde_json::Value::Array(response)));
        }
    }

    fn handle_proposed_announcement(&mut self, inbound: Inbound) {
        let entries = match inbound.message.json_body() {
            Ok(serde_json::Value::Array(entries)) => entries,
            _ => {
                self.ctx
                    .coord
                    .fatal(ReplError::protocol("malformed proposedChanges body"));
                return;
            }
        };

        let mut response = Vec::with_capacity(entries.len());
        for entry in &entries {
            let status = match parse_proposed_entry(entry) {
                Some((doc_id, rev_id, parent)) => {
                    self.find_proposed_change(&doc_id, &rev_id, parent.as_ref())
                }
                None => 400,
            };
            response.push(serde_json::Value::from(status));
        }
        if let Some(responder) = inbound.responder {
            responder.respond(Message::reply().with_json(&serde_json::Value::Array(response)));
        }
    }

    /// Status for a proposed change: 0 = acceptable, 403 = already have
    /// that revision, 409 = our tip is not the stated parent.
    fn find_proposed_change(&self, doc_id: &str, rev_id: &RevId, parent: Option<&RevId>) -> i32 {
        let Some(info) = self.ctx.store.get(doc_id) else {
            return if parent.is_none() { 0 } else { 409 };
        };
        if !self.ctx.store.is_rev_wanted(doc_id, rev_id, None) {
            return 403;
        }
        if Some(&info.rev_id) == parent {
            0
        } else {
            409
        }
    }

    fn handle_send_revision(&mut self, request: RevRequest) {
        let result = self.build_rev_message(&request);
        let message = match result {
            Ok(message) => message,
            Err(error) => {
                self.ctx
                    .pusher
                    .rev_sent(request.sequence, request.doc_id, Err(error));
                return;
            }
        };

        let pusher = self.ctx.pusher.clone();
        let sequence = request.sequence;
        let doc_id = request.doc_id.clone();
        let rev_id = request.rev_id.clone();
        let mark_tx = self.self_tx.clone();
        let send = self.ctx.transport.send_request(
            message,
            Box::new(move |result| {
                let outcome = result.and_then(|reply| reply.check_error());
                if outcome.is_ok() {
                    let _ = mark_tx.send(DbMessage::MarkSynced {
                        doc_id: doc_id.clone(),
                        rev_id,
                    });
                }
                pusher.rev_sent(sequence, doc_id, outcome);
            }),
        );
        if let Err(error) = send {
            self.ctx
                .pusher
                .rev_sent(request.sequence, request.doc_id, Err(error));
        }
    }

    fn build_rev_message(&self, request: &RevRequest) -> ReplResult<Message> {
        let body = if request.deleted {
            self.ctx
                .store
                .body_of(&request.doc_id, &request.rev_id)
                .unwrap_or_default()
        } else {
            self.ctx.store.body_of(&request.doc_id, &request.rev_id)?
        };
        let body = self.rewrite_legacy_attachments(&request.doc_id, body);

        let mut message = Message::new(Profile::Rev)
            .with_property("id", &request.doc_id)
            .with_property("rev", request.rev_id.to_string())
            .with_property("sequence", request.sequence.to_string());
        if request.deleted {
            message = message.with_property("deleted", "true");
        }
        let history = self.history_for(request);
        if !history.is_empty() {
            message = message.with_property("history", history.join(","));
        }
        Ok(message.with_body(body))
    }

    /// Ancestry to send with a revision, truncated at the first ancestor
    /// the peer said it already has.
    fn history_for(&self, request: &RevRequest) -> Vec<String> {
        let known: HashSet<&String> = request.known_ancestors.iter().collect();
        let mut history = Vec::new();
        for ancestor in self
            .ctx
            .store
            .find_ancestors(&request.doc_id, &request.rev_id)
        {
            let text = ancestor.to_string();
            let stop = known.contains(&text);
            history.push(text);
            if stop {
                break;
            }
        }
        history
    }

    /// Rewrites inline legacy attachments into content-addressed stubs.
    ///
    /// Pre-blob-store documents carry attachment data inline under
    /// `_attachments.<name>.data`. Shipping those bodies would duplicate
    /// the bytes on every sync, so the data moves into the blob store and
    /// the body keeps a digest stub.
    fn rewrite_legacy_attachments(&self, doc_id: &str, body: Vec<u8>) -> Vec<u8> {
        if body.is_empty() {
            return body;
        }
        let Ok(root) = decode(&body) else {
            return body;
        };
        let Some(attachments) = root.get("_attachments").and_then(Value::as_map) else {
            return body;
        };

        let mut rewritten = Vec::with_capacity(attachments.len());
        let mut changed = false;
        for (name, meta) in attachments {
            let inline = meta.get("data").and_then(Value::as_bytes);
            match inline {
                Some(data) => {
                    let key = self.ctx.blobs.put(data);
                    let mut stub: Vec<(Value, Value)> = meta
                        .as_map()
                        .map(|pairs| {
                            pairs
                                .iter()
                                .filter(|(k, _)| k.as_text() != Some("data"))
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    stub.push((Value::Text("digest".into()), Value::Text(key.to_string())));
                    stub.push((
                        Value::Text("length".into()),
                        Value::Integer(data.len() as i64),
                    ));
                    stub.push((Value::Text("stub".into()), Value::Bool(true)));
                    rewritten.push((name.clone(), Value::Map(stub)));
                    changed = true;
                }
                None => rewritten.push((name.clone(), meta.clone())),
            }
        }
        if !changed {
            return body;
        }
        debug!(doc_id, "rewrote legacy inline attachments");

        let Some(pairs) = root.as_map() else {
            return body;
        };
        let updated: Vec<(Value, Value)> = pairs
            .iter()
            .map(|(k, v)| {
                if k.as_text() == Some("_attachments") {
                    (k.clone(), Value::Map(rewritten.clone()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        encode(&Value::Map(updated))
    }

    fn handle_set_cookie(&self, header: &str) {
        if !self.ctx.cookies.set_cookie(header, &self.ctx.remote_host) {
            warn!(header, "rejected invalid Set-Cookie header");
            return;
        }
        self.persist_cookies();
    }

    fn persist_cookies(&self) {
        if !self.ctx.cookies.dirty() {
            return;
        }
        self.ctx.store.raw_put(
            COOKIE_NAMESPACE,
            &self.ctx.remote_url,
            self.ctx.cookies.encode(),
        );
        self.ctx.cookies.clear_dirty();
    }

    /// Drains the insert queue and commits everything in one transaction.
    fn flush_inserts(&mut self) {
        let mut revs = self.batcher.drain();
        if revs.is_empty() {
            return;
        }

        let inserts: Vec<RevInsert> = revs
            .iter()
            .map(|rev| RevInsert {
                doc_id: rev.doc_id.clone(),
                rev_id: rev.rev_id.clone(),
                history: rev.history.clone(),
                body: rev.body.clone(),
                deleted: rev.deleted,
                has_attachments: rev.has_attachments,
                no_conflicts: rev.no_conflicts,
                remote_id: Some(self.ctx.options.remote_id),
            })
            .collect();

        let results = self.ctx.store.insert_batch(inserts);
        let mut inserted = 0usize;
        for (rev, result) in revs.iter_mut().zip(results) {
            match result {
                Ok(_) => {
                    inserted += 1;
                    rev.complete(Ok(()));
                }
                Err(StoreError::Conflict { doc_id, rev_id }) => {
                    rev.complete(Err(ReplError::DocumentConflict { doc_id, rev_id }));
                }
                Err(error) => rev.complete(Err(error.into())),
            }
        }
        debug!(inserted, total = revs.len(), "committed insert batch");
    }
}

fn parse_change_entry(entry: &serde_json::Value) -> Option<(String, String, RevId)> {
    let items = entry.as_array()?;
    if items.len() < 3 {
        return None;
    }
    let sequence = match &items[0] {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let doc_id = items[1].as_str()?.to_string();
    let rev_id: RevId = items[2].as_str()?.parse().ok()?;
    Some((sequence, doc_id, rev_id))
}

fn parse_proposed_entry(entry: &serde_json::Value) -> Option<(String, RevId, Option<RevId>)> {
    let items = entry.as_array()?;
    if items.len() < 2 {
        return None;
    }
    let doc_id = items[0].as_str()?.to_string();
    let rev_id: RevId = items[1].as_str()?.parse().ok()?;
    let parent = items
        .get(2)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());
    Some((doc_id, rev_id, parent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_entry_parsing() {
        let entry = serde_json::json!([7, "doc1", "2-abc", 0, 120]);
        let (sequence, doc_id, rev_id) = parse_change_entry(&entry).unwrap();
        assert_eq!(sequence, "7");
        assert_eq!(doc_id, "doc1");
        assert_eq!(rev_id.to_string(), "2-abc");

        let text_seq = serde_json::json!(["5-cursor", "doc1", "2-abc"]);
        let (sequence, _, _) = parse_change_entry(&text_seq).unwrap();
        assert_eq!(sequence, "5-cursor");

        assert!(parse_change_entry(&serde_json::json!(["only-two", "items"])).is_none());
        assert!(parse_change_entry(&serde_json::json!([1, "d", "badrev"])).is_none());
    }

    #[test]
    fn proposed_entry_parsing() {
        let entry = serde_json::json!(["doc1", "2-new", "1-old"]);
        let (doc_id, rev_id, parent) = parse_proposed_entry(&entry).unwrap();
        assert_eq!(doc_id, "doc1");
        assert_eq!(rev_id.to_string(), "2-new");
        assert_eq!(parent.unwrap().to_string(), "1-old");

        let no_parent = serde_json::json!(["doc1", "1-first"]);
        let (_, _, parent) = parse_proposed_entry(&no_parent).unwrap();
        assert!(parent.is_none());
    }
}
