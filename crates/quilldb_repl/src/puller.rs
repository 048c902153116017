//! The puller: drives remote-to-local revision flow.

use crate::db_actor::DbHandle;
use crate::error::{ReplError, ReplResult};
use crate::message::{Message, Profile};
use crate::options::ReplicatorOptions;
use crate::replicator::CoordHandle;
use crate::status::{ActivityLevel, ActorKind};
use crate::transport::{Inbound, Transport};
use crate::types::{DocError, RevToInsert};
use quilldb_store::RevId;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// One announced revision, in arrival order.
#[derive(Debug, Clone)]
pub(crate) struct AnnouncedRev {
    /// The peer's cursor value for this entry.
    pub sequence: String,
    /// Whether the local side asked for the revision.
    pub wanted: bool,
}

/// Mailbox messages for the puller.
pub(crate) enum PullMessage {
    Start {
        cursor: String,
    },
    SubscribeResult {
        result: ReplResult<Message>,
    },
    Announced {
        items: Vec<AnnouncedRev>,
        caught_up: bool,
    },
    RevReceived {
        inbound: Inbound,
    },
    NoRev {
        inbound: Inbound,
    },
    Inserted {
        doc_id: String,
        remote_sequence: Option<String>,
        result: ReplResult<()>,
    },
    Stop,
}

/// Clonable handle to the puller.
#[derive(Clone)]
pub(crate) struct PullerHandle {
    tx: Option<Sender<PullMessage>>,
}

impl PullerHandle {
    /// A handle that drops everything, for sessions without pull.
    pub(crate) fn disabled() -> Self {
        Self { tx: None }
    }

    pub(crate) fn start(&self, cursor: String) {
        self.send(PullMessage::Start { cursor });
    }

    pub(crate) fn announced(&self, items: Vec<AnnouncedRev>, caught_up: bool) {
        self.send(PullMessage::Announced { items, caught_up });
    }

    pub(crate) fn rev_received(&self, inbound: Inbound) {
        self.send(PullMessage::RevReceived { inbound });
    }

    pub(crate) fn no_rev(&self, inbound: Inbound) {
        self.send(PullMessage::NoRev { inbound });
    }

    pub(crate) fn stop(&self) {
        self.send(PullMessage::Stop);
    }

    fn send(&self, message: PullMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(message);
        }
    }
}

/// Spawns the puller thread.
pub(crate) fn spawn(
    db: DbHandle,
    transport: Arc<dyn Transport>,
    coord: CoordHandle,
    options: ReplicatorOptions,
) -> (PullerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let actor = Puller {
        db,
        transport,
        coord,
        continuous: options.pull.is_continuous(),
        options,
        self_tx: tx.clone(),
        level: ActivityLevel::Connecting,
        cursor: String::new(),
        pending: VecDeque::new(),
        caught_up_seen: false,
    };
    let join = std::thread::Builder::new()
        .name("quilldb-puller".to_string())
        .spawn(move || actor.run(rx))
        .expect("failed to spawn puller thread");
    (PullerHandle { tx: Some(tx) }, join)
}

struct PendingRev {
    sequence: String,
    done: bool,
}

/// Mirror of the pusher: subscribes to the peer's change feed, asks for
/// the revisions it wants, and commits them through the insert batcher.
///
/// The pull cursor only advances across the contiguous prefix of
/// announced revisions whose insert transactions have committed, so a
/// crash never skips an uncommitted revision on resume.
struct Puller {
    db: DbHandle,
    transport: Arc<dyn Transport>,
    coord: CoordHandle,
    options: ReplicatorOptions,
    continuous: bool,
    self_tx: Sender<PullMessage>,
    level: ActivityLevel,
    cursor: String,
    pending: VecDeque<PendingRev>,
    caught_up_seen: bool,
}

impl Puller {
    fn run(mut self, rx: Receiver<PullMessage>) {
        while let Ok(message) = rx.recv() {
            match message {
                PullMessage::Start { cursor } => self.handle_start(cursor),
                PullMessage::SubscribeResult { result } => self.handle_subscribe_result(result),
                PullMessage::Announced { items, caught_up } => {
                    self.handle_announced(items, caught_up);
                }
                PullMessage::RevReceived { inbound } => self.handle_rev(inbound),
                PullMessage::NoRev { inbound } => self.handle_no_rev(&inbound),
                PullMessage::Inserted {
                    doc_id,
                    remote_sequence,
                    result,
                } => self.handle_inserted(&doc_id, remote_sequence.as_deref(), result),
                PullMessage::Stop => break,
            }
            if self.level == ActivityLevel::Stopped {
                return;
            }
        }
        self.set_level(ActivityLevel::Stopped);
    }

    fn handle_start(&mut self, cursor: String) {
        info!(since = %cursor, continuous = self.continuous, "pull starting");
        self.cursor = cursor.clone();
        self.set_level(ActivityLevel::Busy);

        let mut message = Message::new(Profile::SubChanges)
            .with_property("since", cursor)
            .with_property("batch", self.options.changes_batch_size.to_string());
        if self.continuous {
            message = message.with_property("continuous", "true");
        }
        if let Some(filter) = &self.options.filter {
            message = message.with_property("filter", filter);
            for (key, value) in &self.options.filter_params {
                message = message.with_property(format!("filter-{key}"), value);
            }
        }

        let reply_to = self.self_tx.clone();
        let send = self.transport.send_request(
            message,
            Box::new(move |result| {
                let _ = reply_to.send(PullMessage::SubscribeResult { result });
            }),
        );
        if let Err(error) = send {
            self.coord.fatal(error);
            self.set_level(ActivityLevel::Stopped);
        }
    }

    fn handle_subscribe_result(&mut self, result: ReplResult<Message>) {
        if let Err(error) = result.and_then(|reply| reply.check_error()) {
            self.coord.fatal(error);
            self.set_level(ActivityLevel::Stopped);
        }
    }

    fn handle_announced(&mut self, items: Vec<AnnouncedRev>, caught_up: bool) {
        if caught_up {
            debug!("peer reports caught up");
            self.caught_up_seen = true;
            self.check_caught_up();
            return;
        }

        self.set_level(ActivityLevel::Busy);
        for item in items {
            self.pending.push_back(PendingRev {
                sequence: item.sequence,
                // Revisions we did not ask for resolve immediately.
                done: !item.wanted,
            });
        }
        self.advance_cursor();
        self.check_caught_up();
    }

    fn handle_rev(&mut self, inbound: Inbound) {
        let message = &inbound.message;
        let Some(doc_id) = message.property("id").map(str::to_string) else {
            self.coord
                .fatal(ReplError::protocol("rev message missing id"));
            return;
        };
        let rev_id: RevId = match message.property("rev").map(str::parse) {
            Some(Ok(rev_id)) => rev_id,
            _ => {
                self.coord
                    .fatal(ReplError::protocol("rev message missing rev"));
                return;
            }
        };
        let history: Vec<RevId> = match message
            .property("history")
            .map(|h| h.split(',').map(str::parse).collect::<Result<_, _>>())
        {
            Some(Ok(history)) => history,
            Some(Err(_)) => {
                self.coord
                    .fatal(ReplError::protocol("rev message has bad history"));
                return;
            }
            None => Vec::new(),
        };
        let remote_sequence = message.property("sequence").map(str::to_string);

        debug!(doc_id = %doc_id, rev = %rev_id, "received revision");
        let reply_to = self.self_tx.clone();
        let responder = inbound.responder;
        let callback_doc = doc_id.clone();
        let callback_seq = remote_sequence.clone();
        let rev = RevToInsert {
            doc_id,
            rev_id,
            history,
            body: message.body().to_vec(),
            deleted: message.bool_property("deleted"),
            has_attachments: message.bool_property("attachments"),
            no_conflicts: self.options.no_conflicts,
            remote_sequence,
            on_complete: Some(Box::new(move |result| {
                if let Some(responder) = responder {
                    match &result {
                        Ok(()) => responder.respond(Message::reply()),
                        Err(error) => {
                            responder.respond(Message::error("web", 422, &error.to_string()));
                        }
                    }
                }
                let _ = reply_to.send(PullMessage::Inserted {
                    doc_id: callback_doc,
                    remote_sequence: callback_seq,
                    result,
                });
            })),
        };
        self.db.insert_revision(rev);
    }

    fn handle_no_rev(&mut self, inbound: &Inbound) {
        let message = &inbound.message;
        let doc_id = message.property("id").unwrap_or("?").to_string();
        let code = message.int_property("error").unwrap_or(500) as i32;
        warn!(doc_id = %doc_id, code, "peer could not send revision");

        self.coord.document_error(DocError {
            doc_id,
            pushing: false,
            error: ReplError::remote("web", code, "peer could not send revision"),
        });
        if let Some(sequence) = message.property("sequence") {
            self.mark_done(sequence);
        }
        self.advance_cursor();
        self.check_caught_up();
    }

    fn handle_inserted(
        &mut self,
        doc_id: &str,
        remote_sequence: Option<&str>,
        result: ReplResult<()>,
    ) {
        if let Err(error) = result {
            if error.is_fatal() {
                self.coord.fatal(error);
                self.set_level(ActivityLevel::Stopped);
                return;
            }
            self.coord.document_error(DocError {
                doc_id: doc_id.to_string(),
                pushing: false,
                error,
            });
        }
        if let Some(sequence) = remote_sequence {
            self.mark_done(sequence);
        }
        self.advance_cursor();
        self.check_caught_up();
    }

    fn mark_done(&mut self, sequence: &str) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.sequence == sequence) {
            pending.done = true;
        }
    }

    /// Advances the cursor across the contiguous committed prefix.
    fn advance_cursor(&mut self) {
        let mut advanced = false;
        while let Some(front) = self.pending.front() {
            if !front.done {
                break;
            }
            self.cursor = front.sequence.clone();
            self.pending.pop_front();
            advanced = true;
        }
        if advanced {
            self.coord.pulled_up_to(self.cursor.clone());
        }
    }

    fn check_caught_up(&mut self) {
        if !self.caught_up_seen || self.pending.iter().any(|p| !p.done) {
            return;
        }
        self.pending.clear();
        if self.continuous {
            if self.level != ActivityLevel::Idle {
                info!("pull caught up, watching for changes");
            }
            self.set_level(ActivityLevel::Idle);
        } else {
            info!(cursor = %self.cursor, "one-shot pull complete");
            self.set_level(ActivityLevel::Stopped);
        }
    }

    fn set_level(&mut self, level: ActivityLevel) {
        if self.level != level {
            self.level = level;
            self.coord.actor_status(ActorKind::Puller, level);
        }
    }
}
