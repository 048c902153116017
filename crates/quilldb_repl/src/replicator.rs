//! The replicator coordinator.

use crate::address::Address;
use crate::checkpoint::{checkpoint_id, reconcile, Checkpoint};
use crate::cookies::CookieStore;
use crate::db_actor::{self, DbActorContext, DbHandle, COOKIE_NAMESPACE};
use crate::error::{ReplError, ReplResult};
use crate::message::{Message, Profile};
use crate::options::ReplicatorOptions;
use crate::puller::{self, PullerHandle};
use crate::pusher::{self, PusherHandle};
use crate::status::{ActivityLevel, ActorKind, Progress, ReplicatorStatus};
use crate::transport::{Inbound, Transport};
use crate::types::DocError;
use parking_lot::{Condvar, Mutex};
use quilldb_store::{BlobStore, DocumentStore};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cap on per-document errors retained in status.
const MAX_DOC_ERRORS: usize = 100;

/// Mailbox messages for the coordinator.
pub(crate) enum CoordMessage {
    LocalCheckpoint {
        checkpoint: Option<Checkpoint>,
        db_empty: bool,
    },
    RemoteCheckpoint {
        result: ReplResult<Message>,
    },
    CheckpointSaved {
        result: ReplResult<Message>,
    },
    ActorStatus {
        actor: ActorKind,
        level: ActivityLevel,
    },
    PushedUpTo {
        sequence: u64,
    },
    PulledUpTo {
        cursor: String,
    },
    DocumentError(DocError),
    Fatal(ReplError),
    Inbound(Inbound),
    Stop,
}

/// Clonable address of the coordinator mailbox.
///
/// Sub-actors hold this instead of a reference to the replicator, which
/// breaks the ownership cycle between them.
#[derive(Clone)]
pub(crate) struct CoordHandle {
    tx: Sender<CoordMessage>,
}

impl CoordHandle {
    pub(crate) fn actor_status(&self, actor: ActorKind, level: ActivityLevel) {
        let _ = self.tx.send(CoordMessage::ActorStatus { actor, level });
    }

    pub(crate) fn pushed_up_to(&self, sequence: u64) {
        let _ = self.tx.send(CoordMessage::PushedUpTo { sequence });
    }

    pub(crate) fn pulled_up_to(&self, cursor: String) {
        let _ = self.tx.send(CoordMessage::PulledUpTo { cursor });
    }

    pub(crate) fn document_error(&self, error: DocError) {
        let _ = self.tx.send(CoordMessage::DocumentError(error));
    }

    pub(crate) fn fatal(&self, error: ReplError) {
        let _ = self.tx.send(CoordMessage::Fatal(error));
    }
}

struct StatusCell {
    state: Mutex<ReplicatorStatus>,
    changed: Condvar,
}

/// Everything needed to start a replication session.
pub struct ReplicatorContext {
    /// The local document store.
    pub store: Arc<DocumentStore>,
    /// The shared blob store.
    pub blobs: Arc<BlobStore>,
    /// The connection to the peer.
    pub transport: Arc<dyn Transport>,
    /// Peer-initiated messages from the transport.
    pub inbound: Receiver<Inbound>,
    /// The peer's URL.
    pub remote_url: String,
    /// Session options.
    pub options: ReplicatorOptions,
    /// Cookie store to use; defaults to one loaded from the local store.
    pub cookies: Option<Arc<CookieStore>>,
}

/// A bidirectional replication session.
///
/// Owns the database actor, the pusher, and the puller, and rolls their
/// activity up into one externally visible status. Construction starts
/// the session immediately.
pub struct Replicator {
    coord_tx: Sender<CoordMessage>,
    status: Arc<StatusCell>,
    cookies: Arc<CookieStore>,
}

impl Replicator {
    /// Starts a replication session.
    ///
    /// # Errors
    ///
    /// Fails on an unparseable remote URL or if neither direction is
    /// enabled.
    pub fn start(ctx: ReplicatorContext) -> ReplResult<Self> {
        let address = Address::parse(&ctx.remote_url)?;
        if !ctx.options.push.is_active() && !ctx.options.pull.is_active() {
            return Err(ReplError::protocol("neither push nor pull is enabled"));
        }

        let cookies = ctx.cookies.unwrap_or_else(|| {
            let store = ctx
                .store
                .raw_get(COOKIE_NAMESPACE, &ctx.remote_url)
                .map(|data| CookieStore::from_encoded(&data))
                .unwrap_or_default();
            Arc::new(store)
        });

        let status = Arc::new(StatusCell {
            state: Mutex::new(ReplicatorStatus {
                level: ActivityLevel::Connecting,
                ..ReplicatorStatus::default()
            }),
            changed: Condvar::new(),
        });

        let (coord_tx, coord_rx) = mpsc::channel();
        let coord = CoordHandle {
            tx: coord_tx.clone(),
        };

        let (db, db_rx) = db_actor::channel();

        let (pusher, _pusher_join) = if ctx.options.push.is_active() {
            let (handle, join) = pusher::spawn(
                db.clone(),
                Arc::clone(&ctx.transport),
                coord.clone(),
                ctx.options.clone(),
            );
            (handle, Some(join))
        } else {
            (PusherHandle::disabled(), None)
        };

        let (puller, _puller_join) = if ctx.options.pull.is_active() {
            let (handle, join) = puller::spawn(
                db.clone(),
                Arc::clone(&ctx.transport),
                coord.clone(),
                ctx.options.clone(),
            );
            (handle, Some(join))
        } else {
            (PullerHandle::disabled(), None)
        };

        let _db_join = db_actor::spawn(
            DbActorContext {
                store: Arc::clone(&ctx.store),
                blobs: Arc::clone(&ctx.blobs),
                transport: Arc::clone(&ctx.transport),
                cookies: Arc::clone(&cookies),
                options: ctx.options.clone(),
                remote_host: address.host.clone(),
                remote_url: ctx.remote_url.clone(),
                coord: coord.clone(),
                pusher: pusher.clone(),
                puller: puller.clone(),
            },
            &db,
            db_rx,
        );

        // Route peer-initiated messages onto the coordinator mailbox.
        let router_tx = coord_tx.clone();
        let inbound = ctx.inbound;
        std::thread::Builder::new()
            .name("quilldb-inbound".to_string())
            .spawn(move || {
                while let Ok(message) = inbound.recv() {
                    if router_tx.send(CoordMessage::Inbound(message)).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn inbound router thread");

        let checkpoint_key = checkpoint_id(&ctx.store.uuid(), &ctx.remote_url, &ctx.options);
        info!(remote = %ctx.remote_url, key = %checkpoint_key, "replication starting");

        let mut levels = HashMap::new();
        levels.insert(
            ActorKind::Pusher,
            if ctx.options.push.is_active() {
                ActivityLevel::Connecting
            } else {
                ActivityLevel::Stopped
            },
        );
        levels.insert(
            ActorKind::Puller,
            if ctx.options.pull.is_active() {
                ActivityLevel::Connecting
            } else {
                ActivityLevel::Stopped
            },
        );
        levels.insert(ActorKind::Db, ActivityLevel::Idle);

        let coordinator = Coordinator {
            store: ctx.store,
            transport: ctx.transport,
            options: ctx.options,
            db,
            pusher,
            puller,
            status: Arc::clone(&status),
            self_tx: coord_tx.clone(),
            checkpoint_key,
            checkpoint: Checkpoint::default(),
            checkpoint_dirty: false,
            remote_checkpoint_rev: None,
            local_checkpoint: None,
            levels,
            started: false,
            stopping: false,
            finished: false,
            connect_attempt: 0,
        };
        std::thread::Builder::new()
            .name("quilldb-replicator".to_string())
            .spawn(move || coordinator.run(coord_rx))
            .expect("failed to spawn coordinator thread");

        Ok(Self {
            coord_tx,
            status,
            cookies,
        })
    }

    /// A snapshot of the current status.
    pub fn status(&self) -> ReplicatorStatus {
        self.status.state.lock().clone()
    }

    /// The session's cookie store.
    pub fn cookies(&self) -> Arc<CookieStore> {
        Arc::clone(&self.cookies)
    }

    /// Requests a graceful stop.
    pub fn stop(&self) {
        let _ = self.coord_tx.send(CoordMessage::Stop);
    }

    /// Blocks until the status satisfies `pred` or the timeout elapses.
    /// Returns whether the predicate held.
    pub fn wait_for<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&ReplicatorStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.status.state.lock();
        while !pred(&state) {
            if self
                .status
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return pred(&state);
            }
        }
        true
    }

    /// Blocks until the replicator reaches the given level.
    pub fn wait_for_level(&self, level: ActivityLevel, timeout: Duration) -> bool {
        self.wait_for(timeout, |status| status.level == level)
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        let _ = self.coord_tx.send(CoordMessage::Stop);
    }
}

struct Coordinator {
    store: Arc<DocumentStore>,
    transport: Arc<dyn Transport>,
    options: ReplicatorOptions,
    db: DbHandle,
    pusher: PusherHandle,
    puller: PullerHandle,
    status: Arc<StatusCell>,
    self_tx: Sender<CoordMessage>,
    checkpoint_key: String,
    checkpoint: Checkpoint,
    checkpoint_dirty: bool,
    remote_checkpoint_rev: Option<String>,
    local_checkpoint: Option<Checkpoint>,
    levels: HashMap<ActorKind, ActivityLevel>,
    started: bool,
    stopping: bool,
    finished: bool,
    connect_attempt: u32,
}

impl Coordinator {
    fn run(mut self, rx: Receiver<CoordMessage>) {
        // Kick off the startup sequence: local checkpoint, then remote.
        let reply_to = self.self_tx.clone();
        self.db.get_checkpoint(
            self.checkpoint_key.clone(),
            Box::new(move |checkpoint, db_empty| {
                let _ = reply_to.send(CoordMessage::LocalCheckpoint {
                    checkpoint,
                    db_empty,
                });
            }),
        );

        while let Ok(message) = rx.recv() {
            match message {
                CoordMessage::LocalCheckpoint {
                    checkpoint,
                    db_empty,
                } => {
                    debug!(?checkpoint, db_empty, "read local checkpoint");
                    self.local_checkpoint = checkpoint;
                    self.fetch_remote_checkpoint();
                }
                CoordMessage::RemoteCheckpoint { result } => self.handle_remote_checkpoint(result),
                CoordMessage::CheckpointSaved { result } => self.handle_checkpoint_saved(result),
                CoordMessage::ActorStatus { actor, level } => self.handle_actor_status(actor, level),
                CoordMessage::PushedUpTo { sequence } => {
                    if sequence > self.checkpoint.local_seq {
                        self.checkpoint.local_seq = sequence;
                        self.checkpoint_dirty = true;
                        let total = self.store.last_sequence();
                        let mut state = self.status.state.lock();
                        state.progress = Progress {
                            completed: sequence,
                            total,
                        };
                        self.status.changed.notify_all();
                    }
                }
                CoordMessage::PulledUpTo { cursor } => {
                    if cursor != self.checkpoint.remote_cursor {
                        self.checkpoint.remote_cursor = cursor;
                        self.checkpoint_dirty = true;
                    }
                }
                CoordMessage::DocumentError(error) => {
                    if error.error == ReplError::Cancelled {
                        continue;
                    }
                    warn!(doc_id = %error.doc_id, pushing = error.pushing, error = %error.error,
                        "document error");
                    let mut state = self.status.state.lock();
                    if state.doc_errors.len() < MAX_DOC_ERRORS {
                        state.doc_errors.push(error);
                    }
                }
                CoordMessage::Fatal(error) => self.handle_fatal(error),
                CoordMessage::Inbound(inbound) => self.route_inbound(inbound),
                CoordMessage::Stop => self.begin_stop(),
            }

            if self.finished {
                break;
            }
        }
    }

    fn fetch_remote_checkpoint(&mut self) {
        let message = Message::new(Profile::GetCheckpoint)
            .with_property("client", self.checkpoint_key.clone());
        let reply_to = self.self_tx.clone();
        let send = self.transport.send_request(
            message,
            Box::new(move |result| {
                let _ = reply_to.send(CoordMessage::RemoteCheckpoint { result });
            }),
        );
        if let Err(error) = send {
            self.handle_fatal(error);
        }
    }

    fn handle_remote_checkpoint(&mut self, result: ReplResult<Message>) {
        let remote = match result {
            Ok(reply) => match reply.check_error() {
                Ok(()) => {
                    self.remote_checkpoint_rev = reply.property("rev").map(str::to_string);
                    Checkpoint::from_bytes(reply.body()).ok()
                }
                // A 404 means the peer has never seen this session.
                Err(ReplError::Remote { code: 404, .. }) => None,
                Err(error) => {
                    self.handle_connect_error(error);
                    return;
                }
            },
            Err(error) => {
                self.handle_connect_error(error);
                return;
            }
        };

        let effective = reconcile(self.local_checkpoint.as_ref(), remote.as_ref());
        if self.local_checkpoint.is_some() && effective == Checkpoint::default() {
            if self.local_checkpoint.as_ref() != remote.as_ref() {
                info!("checkpoint mismatch, starting over");
            }
        }
        info!(
            local_seq = effective.local_seq,
            remote_cursor = %effective.remote_cursor,
            "session established"
        );
        self.checkpoint = effective;
        self.started = true;
        self.connect_attempt = 0;

        if self.options.push.is_active() {
            self.pusher.start(self.checkpoint.local_seq);
        }
        if self.options.pull.is_active() {
            self.puller.start(self.checkpoint.remote_cursor.clone());
        }
    }

    fn handle_connect_error(&mut self, error: ReplError) {
        if error.is_transient() && self.connect_attempt + 1 < self.options.retry.max_attempts {
            self.connect_attempt += 1;
            let delay = self.options.retry.delay_for_attempt(self.connect_attempt);
            warn!(attempt = self.connect_attempt, ?delay, error = %error,
                "transient connection error, backing off");
            self.set_overall_level(ActivityLevel::Offline);
            std::thread::sleep(delay);
            self.set_overall_level(ActivityLevel::Connecting);
            self.fetch_remote_checkpoint();
        } else {
            self.handle_fatal(error);
        }
    }

    fn handle_checkpoint_saved(&mut self, result: ReplResult<Message>) {
        match result.and_then(|reply| reply.check_error().map(|()| reply)) {
            Ok(reply) => {
                self.remote_checkpoint_rev = reply.property("rev").map(str::to_string);
                debug!("remote checkpoint saved");
            }
            Err(error) => warn!(error = %error, "failed to save remote checkpoint"),
        }
    }

    fn handle_actor_status(&mut self, actor: ActorKind, level: ActivityLevel) {
        debug!(?actor, ?level, "actor status");
        self.levels.insert(actor, level);

        // Caught-up and finished actors are checkpoint-save points.
        if matches!(level, ActivityLevel::Idle | ActivityLevel::Stopped) {
            self.save_checkpoint();
        }

        let workers_done = self.levels[&ActorKind::Pusher] == ActivityLevel::Stopped
            && self.levels[&ActorKind::Puller] == ActivityLevel::Stopped;
        if workers_done && self.levels[&ActorKind::Db] != ActivityLevel::Stopped {
            // Push and pull are finished; flush and stop the DB actor.
            self.db.stop();
            return;
        }
        if workers_done && self.levels[&ActorKind::Db] == ActivityLevel::Stopped {
            self.finish();
            return;
        }

        if self.started && !self.stopping {
            let rollup = self.levels.values().copied().max().unwrap_or_default();
            self.set_overall_level(rollup);
        }
    }

    fn handle_fatal(&mut self, error: ReplError) {
        if self.stopping {
            return;
        }
        if error == ReplError::Cancelled {
            self.begin_stop();
            return;
        }
        warn!(error = %error, "fatal replication error");
        {
            let mut state = self.status.state.lock();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.begin_stop();
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!("stopping replication");
        self.pusher.stop();
        self.puller.stop();
        self.transport.cancel_pending();
    }

    fn route_inbound(&mut self, inbound: Inbound) {
        match inbound.message.profile() {
            Profile::Changes | Profile::ProposedChanges => self.db.find_or_request_revs(inbound),
            Profile::Rev => self.puller.rev_received(inbound),
            Profile::NoRev => self.puller.no_rev(inbound),
            profile => {
                debug!(profile = profile.as_str(), "unexpected inbound message");
                if let Some(responder) = inbound.responder {
                    responder.respond(Message::error("proto", 501, "unsupported profile"));
                }
            }
        }
    }

    fn save_checkpoint(&mut self) {
        if !self.checkpoint_dirty || !self.started {
            return;
        }
        self.checkpoint_dirty = false;

        self.db
            .set_checkpoint(self.checkpoint_key.clone(), self.checkpoint.clone());

        let mut message = Message::new(Profile::SetCheckpoint)
            .with_property("client", self.checkpoint_key.clone());
        if let Some(rev) = &self.remote_checkpoint_rev {
            message = message.with_property("rev", rev);
        }
        let message = message.with_body(self.checkpoint.to_bytes());
        let reply_to = self.self_tx.clone();
        let send = self.transport.send_request(
            message,
            Box::new(move |result| {
                let _ = reply_to.send(CoordMessage::CheckpointSaved { result });
            }),
        );
        if let Err(error) = send {
            warn!(error = %error, "failed to send checkpoint");
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.save_checkpoint();
        self.transport.close();
        info!("replication finished");
        self.set_overall_level(ActivityLevel::Stopped);
    }

    fn set_overall_level(&self, level: ActivityLevel) {
        let mut state = self.status.state.lock();
        if state.level != level {
            state.level = level;
            self.status.changed.notify_all();
        }
    }
}
