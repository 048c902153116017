//! The pusher: drives local-to-remote revision flow.

use crate::db_actor::DbHandle;
use crate::error::{ReplError, ReplResult};
use crate::message::{Message, Profile};
use crate::options::ReplicatorOptions;
use crate::replicator::CoordHandle;
use crate::status::{ActivityLevel, ActorKind};
use crate::transport::Transport;
use crate::types::{DocError, RevRequest};
use quilldb_store::ChangeEntry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Window of revision sends allowed in flight at once.
pub const MAX_OUTSTANDING_REVS: usize = 8;

/// A change entry enriched with what the remote already has.
#[derive(Debug, Clone)]
pub(crate) struct PushChange {
    /// The change feed entry.
    pub entry: ChangeEntry,
    /// The peer's last known revision of this document, if recorded.
    pub remote_ancestor: Option<String>,
}

/// Mailbox messages for the pusher.
pub(crate) enum PushMessage {
    Start {
        since: u64,
    },
    Changes {
        changes: Vec<PushChange>,
        more: bool,
    },
    ChangesResponse {
        changes: Vec<PushChange>,
        result: ReplResult<Message>,
    },
    RevSent {
        sequence: u64,
        doc_id: String,
        result: ReplResult<()>,
    },
    Stop,
}

/// Clonable handle to the pusher.
#[derive(Clone)]
pub(crate) struct PusherHandle {
    tx: Option<Sender<PushMessage>>,
}

impl PusherHandle {
    /// A handle that drops everything, for sessions without push.
    pub(crate) fn disabled() -> Self {
        Self { tx: None }
    }

    pub(crate) fn start(&self, since: u64) {
        self.send(PushMessage::Start { since });
    }

    pub(crate) fn changes(&self, changes: Vec<PushChange>, more: bool) {
        self.send(PushMessage::Changes { changes, more });
    }

    pub(crate) fn rev_sent(&self, sequence: u64, doc_id: String, result: ReplResult<()>) {
        self.send(PushMessage::RevSent {
            sequence,
            doc_id,
            result,
        });
    }

    pub(crate) fn stop(&self) {
        self.send(PushMessage::Stop);
    }

    fn send(&self, message: PushMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(message);
        }
    }
}

/// Spawns the pusher thread.
pub(crate) fn spawn(
    db: DbHandle,
    transport: Arc<dyn Transport>,
    coord: CoordHandle,
    options: ReplicatorOptions,
) -> (PusherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let actor = Pusher {
        db,
        transport,
        coord,
        continuous: options.push.is_continuous(),
        proposing: options.no_conflicts,
        self_tx: tx.clone(),
        level: ActivityLevel::Connecting,
        frontier: BTreeMap::new(),
        rev_queue: VecDeque::new(),
        outstanding: 0,
        last_pushed: 0,
        max_seen: 0,
        awaiting_changes: false,
        more_pending: false,
    };
    let join = std::thread::Builder::new()
        .name("quilldb-pusher".to_string())
        .spawn(move || actor.run(rx))
        .expect("failed to spawn pusher thread");
    (PusherHandle { tx: Some(tx) }, join)
}

/// State machine: Connecting → Busy → (Idle | Stopped).
///
/// `frontier` tracks every sequence handed to us by the change feed that
/// has not yet been fully resolved (acknowledged, skipped, or failed).
/// The checkpoint only advances across the contiguous resolved prefix,
/// which is what makes delivery at-least-once across restarts.
struct Pusher {
    db: DbHandle,
    transport: Arc<dyn Transport>,
    coord: CoordHandle,
    continuous: bool,
    proposing: bool,
    self_tx: Sender<PushMessage>,
    level: ActivityLevel,
    frontier: BTreeMap<u64, bool>,
    rev_queue: VecDeque<RevRequest>,
    outstanding: usize,
    last_pushed: u64,
    max_seen: u64,
    awaiting_changes: bool,
    more_pending: bool,
}

impl Pusher {
    fn run(mut self, rx: Receiver<PushMessage>) {
        while let Ok(message) = rx.recv() {
            match message {
                PushMessage::Start { since } => self.handle_start(since),
                PushMessage::Changes { changes, more } => self.handle_changes(changes, more),
                PushMessage::ChangesResponse { changes, result } => {
                    self.handle_changes_response(changes, result);
                }
                PushMessage::RevSent {
                    sequence,
                    doc_id,
                    result,
                } => self.handle_rev_sent(sequence, &doc_id, result),
                PushMessage::Stop => break,
            }
            if self.level == ActivityLevel::Stopped {
                return;
            }
        }
        self.set_level(ActivityLevel::Stopped);
    }

    fn handle_start(&mut self, since: u64) {
        info!(since, continuous = self.continuous, "push starting");
        self.last_pushed = since;
        self.max_seen = since;
        self.set_level(ActivityLevel::Busy);
        self.awaiting_changes = true;
        self.db.get_changes(since);
    }

    fn handle_changes(&mut self, changes: Vec<PushChange>, more: bool) {
        self.awaiting_changes = false;
        self.more_pending = more;

        if changes.is_empty() {
            // A batch can come back empty with more remaining when every
            // entry was filtered out; keep draining.
            self.maybe_request_more();
            self.check_caught_up();
            return;
        }

        self.set_level(ActivityLevel::Busy);
        for change in &changes {
            self.max_seen = self.max_seen.max(change.entry.sequence);
            self.frontier.insert(change.entry.sequence, false);
        }

        let profile = if self.proposing {
            Profile::ProposedChanges
        } else {
            Profile::Changes
        };
        let body: Vec<serde_json::Value> = changes
            .iter()
            .map(|change| {
                if self.proposing {
                    serde_json::json!([
                        change.entry.doc_id,
                        change.entry.rev_id.to_string(),
                        change.remote_ancestor,
                    ])
                } else {
                    serde_json::json!([
                        change.entry.sequence,
                        change.entry.doc_id,
                        change.entry.rev_id.to_string(),
                        i32::from(change.entry.deleted),
                        change.entry.body_size,
                    ])
                }
            })
            .collect();

        debug!(count = changes.len(), proposing = self.proposing, "announcing changes");
        let message = Message::new(profile).with_json(&serde_json::Value::Array(body));
        let reply_to = self.self_tx.clone();
        let send = self.transport.send_request(
            message,
            Box::new(move |result| {
                let _ = reply_to.send(PushMessage::ChangesResponse { changes, result });
            }),
        );
        if let Err(error) = send {
            self.coord.fatal(error);
            self.set_level(ActivityLevel::Stopped);
        }
    }

    fn handle_changes_response(&mut self, changes: Vec<PushChange>, result: ReplResult<Message>) {
        let reply = match result.and_then(|reply| reply.check_error().map(|()| reply)) {
            Ok(reply) => reply,
            Err(error) => {
                self.coord.fatal(error);
                self.set_level(ActivityLevel::Stopped);
                return;
            }
        };

        let answers = match reply.json_body() {
            Ok(serde_json::Value::Array(answers)) => answers,
            Ok(serde_json::Value::Null) => Vec::new(),
            Ok(_) | Err(_) => {
                self.coord
                    .fatal(ReplError::protocol("malformed changes response"));
                self.set_level(ActivityLevel::Stopped);
                return;
            }
        };

        for (i, change) in changes.into_iter().enumerate() {
            let answer = answers.get(i);
            if self.proposing {
                self.handle_proposed_answer(change, answer);
            } else {
                self.handle_changes_answer(change, answer);
            }
        }

        self.dispatch_revs();
        self.advance_checkpoint();
        self.maybe_request_more();
        self.check_caught_up();
    }

    /// A `changes` reply entry is `0` (not wanted) or an array of the
    /// ancestors the peer already has.
    fn handle_changes_answer(&mut self, change: PushChange, answer: Option<&serde_json::Value>) {
        match answer {
            Some(serde_json::Value::Array(ancestors)) => {
                let known_ancestors = ancestors
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect();
                self.rev_queue.push_back(RevRequest {
                    doc_id: change.entry.doc_id,
                    rev_id: change.entry.rev_id,
                    sequence: change.entry.sequence,
                    known_ancestors,
                    deleted: change.entry.deleted,
                });
            }
            // Absent entries and `0` both mean the peer has it already.
            _ => self.mark_done(change.entry.sequence),
        }
    }

    /// A `proposedChanges` reply entry is a status: 0 = send it, anything
    /// else is an HTTP-style per-document rejection.
    fn handle_proposed_answer(&mut self, change: PushChange, answer: Option<&serde_json::Value>) {
        let status = answer.and_then(serde_json::Value::as_i64).unwrap_or(0);
        if status == 0 {
            let known_ancestors = change.remote_ancestor.clone().into_iter().collect();
            self.rev_queue.push_back(RevRequest {
                doc_id: change.entry.doc_id,
                rev_id: change.entry.rev_id,
                sequence: change.entry.sequence,
                known_ancestors,
                deleted: change.entry.deleted,
            });
        } else {
            self.coord.document_error(DocError {
                doc_id: change.entry.doc_id.clone(),
                pushing: true,
                error: ReplError::remote("web", status as i32, "proposed change rejected"),
            });
            self.mark_done(change.entry.sequence);
        }
    }

    fn handle_rev_sent(&mut self, sequence: u64, doc_id: &str, result: ReplResult<()>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.mark_done(sequence);
        if let Err(error) = result {
            if error.is_fatal() {
                self.coord.fatal(error);
                self.set_level(ActivityLevel::Stopped);
                return;
            }
            self.coord.document_error(DocError {
                doc_id: doc_id.to_string(),
                pushing: true,
                error,
            });
        }
        self.dispatch_revs();
        self.advance_checkpoint();
        self.maybe_request_more();
        self.check_caught_up();
    }

    fn dispatch_revs(&mut self) {
        while self.outstanding < MAX_OUTSTANDING_REVS {
            let Some(request) = self.rev_queue.pop_front() else {
                break;
            };
            self.outstanding += 1;
            self.db.send_revision(request);
        }
    }

    fn maybe_request_more(&mut self) {
        if self.more_pending && !self.awaiting_changes && self.rev_queue.len() < MAX_OUTSTANDING_REVS
        {
            self.more_pending = false;
            self.awaiting_changes = true;
            self.db.get_changes(self.max_seen);
        }
    }

    fn mark_done(&mut self, sequence: u64) {
        if let Some(done) = self.frontier.get_mut(&sequence) {
            *done = true;
        }
    }

    /// Advances the checkpoint across the contiguous resolved prefix.
    fn advance_checkpoint(&mut self) {
        let mut advanced = false;
        while let Some((&sequence, &done)) = self.frontier.iter().next() {
            if !done {
                break;
            }
            self.frontier.remove(&sequence);
            self.last_pushed = self.last_pushed.max(sequence);
            advanced = true;
        }
        if advanced {
            self.coord.pushed_up_to(self.last_pushed);
        }
    }

    fn check_caught_up(&mut self) {
        let drained = self.frontier.is_empty()
            && self.rev_queue.is_empty()
            && self.outstanding == 0
            && !self.more_pending
            && !self.awaiting_changes;
        if !drained {
            return;
        }
        if self.continuous {
            if self.level != ActivityLevel::Idle {
                info!("push caught up, watching for changes");
            }
            self.set_level(ActivityLevel::Idle);
        } else {
            info!(last_pushed = self.last_pushed, "one-shot push complete");
            self.set_level(ActivityLevel::Stopped);
        }
    }

    fn set_level(&mut self, level: ActivityLevel) {
        if self.level != level {
            self.level = level;
            self.coord.actor_status(ActorKind::Pusher, level);
        }
    }
}
