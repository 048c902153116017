//! An in-process peer for exercising the replicator without a network.
//!
//! `LoopbackPeer` plays the passive side of the protocol: it serves
//! checkpoints, answers change announcements, stores pushed revisions,
//! and feeds its own documents to a subscriber. Request handling is
//! synchronous on the caller's thread except for change-feed delivery,
//! which runs on a worker so the puller is free to process it.

use crate::error::{ReplError, ReplResult};
use crate::message::{Message, Profile};
use crate::transport::{Inbound, ResponseCallback, Transport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

/// One document held by the peer.
#[derive(Debug, Clone)]
pub struct PeerDoc {
    /// Current revision ID.
    pub rev_id: String,
    /// Ancestor revision IDs, descending generation.
    pub history: Vec<String>,
    /// Encoded body.
    pub body: Vec<u8>,
    /// True for a tombstone.
    pub deleted: bool,
    /// Peer-side sequence.
    pub sequence: u64,
}

#[derive(Default)]
struct PeerState {
    docs: HashMap<String, PeerDoc>,
    by_seq: BTreeMap<u64, String>,
    last_seq: u64,
    checkpoints: HashMap<String, (u64, Vec<u8>)>,
}

/// The in-process remote replica.
pub struct LoopbackPeer {
    state: Mutex<PeerState>,
    inbound_tx: Sender<Inbound>,
    closed: AtomicBool,
    rev_bodies_received: AtomicUsize,
    self_ref: Mutex<Weak<LoopbackPeer>>,
}

impl LoopbackPeer {
    /// Creates a peer and the inbound channel to hand to the replicator.
    pub fn new() -> (Arc<Self>, Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let peer = Arc::new(Self {
            state: Mutex::new(PeerState::default()),
            inbound_tx,
            closed: AtomicBool::new(false),
            rev_bodies_received: AtomicUsize::new(0),
            self_ref: Mutex::new(Weak::new()),
        });
        *peer.self_ref.lock() = Arc::downgrade(&peer);
        (peer, inbound_rx)
    }

    /// Seeds a document on the peer.
    pub fn insert_doc(
        &self,
        doc_id: &str,
        rev_id: &str,
        history: &[&str],
        body: Vec<u8>,
        deleted: bool,
    ) {
        let mut state = self.state.lock();
        state.last_seq += 1;
        let sequence = state.last_seq;
        let stale = state.docs.get(doc_id).map(|doc| doc.sequence);
        if let Some(stale) = stale {
            state.by_seq.remove(&stale);
        }
        state.by_seq.insert(sequence, doc_id.to_string());
        state.docs.insert(
            doc_id.to_string(),
            PeerDoc {
                rev_id: rev_id.to_string(),
                history: history.iter().map(|s| (*s).to_string()).collect(),
                body,
                deleted,
                sequence,
            },
        );
    }

    /// Reads a document from the peer.
    pub fn doc(&self, doc_id: &str) -> Option<PeerDoc> {
        self.state.lock().docs.get(doc_id).cloned()
    }

    /// Number of documents on the peer.
    pub fn doc_count(&self) -> usize {
        self.state.lock().docs.len()
    }

    /// Number of `rev` message bodies the peer has received. Idempotent
    /// re-pushes must not grow this.
    pub fn rev_bodies_received(&self) -> usize {
        self.rev_bodies_received.load(Ordering::SeqCst)
    }

    /// The stored checkpoint body for a client key.
    pub fn checkpoint_body(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .checkpoints
            .get(key)
            .map(|(_, body)| body.clone())
    }

    /// Forgets all stored checkpoints.
    pub fn clear_checkpoints(&self) {
        self.state.lock().checkpoints.clear();
    }

    fn handle(&self, message: &Message) -> Message {
        match message.profile() {
            Profile::GetCheckpoint => self.handle_get_checkpoint(message),
            Profile::SetCheckpoint => self.handle_set_checkpoint(message),
            Profile::Changes => self.handle_changes(message),
            Profile::ProposedChanges => self.handle_proposed_changes(message),
            Profile::Rev => self.handle_rev(message),
            Profile::SubChanges => self.handle_sub_changes(message),
            _ => Message::error("proto", 501, "unsupported profile"),
        }
    }

    fn handle_get_checkpoint(&self, message: &Message) -> Message {
        let Some(client) = message.property("client") else {
            return Message::error("web", 400, "missing client");
        };
        match self.state.lock().checkpoints.get(client) {
            Some((rev, body)) => Message::reply()
                .with_property("rev", rev.to_string())
                .with_body(body.clone()),
            None => Message::error("web", 404, "no checkpoint"),
        }
    }

    fn handle_set_checkpoint(&self, message: &Message) -> Message {
        let Some(client) = message.property("client") else {
            return Message::error("web", 400, "missing client");
        };
        let mut state = self.state.lock();
        let current = state.checkpoints.get(client).map(|(rev, _)| *rev);
        if let Some(current) = current {
            let stated = message
                .property("rev")
                .and_then(|r| r.parse::<u64>().ok());
            if stated != Some(current) {
                return Message::error("web", 409, "checkpoint rev mismatch");
            }
        }
        let next = current.unwrap_or(0) + 1;
        state
            .checkpoints
            .insert(client.to_string(), (next, message.body().to_vec()));
        Message::reply().with_property("rev", next.to_string())
    }

    /// Answers a push announcement: `0` for revisions already present,
    /// known ancestors (possibly empty) for wanted ones.
    fn handle_changes(&self, message: &Message) -> Message {
        let Ok(serde_json::Value::Array(entries)) = message.json_body() else {
            return Message::error("web", 400, "bad changes body");
        };
        let state = self.state.lock();
        let answers: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                let doc_id = entry.get(1).and_then(|v| v.as_str()).unwrap_or("");
                let rev_id = entry.get(2).and_then(|v| v.as_str()).unwrap_or("");
                match state.docs.get(doc_id) {
                    Some(doc) if doc.rev_id == rev_id => serde_json::Value::from(0),
                    Some(doc) => serde_json::json!([doc.rev_id]),
                    None => serde_json::json!([]),
                }
            })
            .collect();
        Message::reply().with_json(&serde_json::Value::Array(answers))
    }

    fn handle_proposed_changes(&self, message: &Message) -> Message {
        let Ok(serde_json::Value::Array(entries)) = message.json_body() else {
            return Message::error("web", 400, "bad proposedChanges body");
        };
        let state = self.state.lock();
        let answers: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                let doc_id = entry.get(0).and_then(|v| v.as_str()).unwrap_or("");
                let rev_id = entry.get(1).and_then(|v| v.as_str()).unwrap_or("");
                let parent = entry.get(2).and_then(|v| v.as_str());
                let status = match state.docs.get(doc_id) {
                    None => {
                        if parent.is_none() {
                            0
                        } else {
                            409
                        }
                    }
                    Some(doc) if doc.rev_id == rev_id => 403,
                    Some(doc) if Some(doc.rev_id.as_str()) == parent => 0,
                    Some(_) => 409,
                };
                serde_json::Value::from(status)
            })
            .collect();
        Message::reply().with_json(&serde_json::Value::Array(answers))
    }

    fn handle_rev(&self, message: &Message) -> Message {
        let Some(doc_id) = message.property("id") else {
            return Message::error("web", 400, "rev missing id");
        };
        let Some(rev_id) = message.property("rev") else {
            return Message::error("web", 400, "rev missing rev");
        };
        let history: Vec<&str> = message
            .property("history")
            .map(|h| h.split(',').collect())
            .unwrap_or_default();
        self.rev_bodies_received.fetch_add(1, Ordering::SeqCst);
        self.insert_doc(
            doc_id,
            rev_id,
            &history,
            message.body().to_vec(),
            message.bool_property("deleted"),
        );
        Message::reply()
    }

    /// Starts the outbound change feed on a worker thread and replies to
    /// the subscription immediately.
    fn handle_sub_changes(&self, message: &Message) -> Message {
        let since = message
            .property("since")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let Some(peer) = self.self_ref.lock().upgrade() else {
            return Message::error("web", 500, "peer shutting down");
        };
        std::thread::Builder::new()
            .name("loopback-feed".to_string())
            .spawn(move || peer.run_feed(since))
            .expect("failed to spawn loopback feed thread");
        Message::reply()
    }

    fn run_feed(self: Arc<Self>, since: u64) {
        let entries: Vec<(u64, PeerDoc, String)> = {
            let state = self.state.lock();
            state
                .by_seq
                .range(since + 1..)
                .filter_map(|(&seq, doc_id)| {
                    state
                        .docs
                        .get(doc_id)
                        .map(|doc| (seq, doc.clone(), doc_id.clone()))
                })
                .collect()
        };

        if !entries.is_empty() {
            let body: Vec<serde_json::Value> = entries
                .iter()
                .map(|(seq, doc, doc_id)| {
                    serde_json::json!([
                        seq,
                        doc_id,
                        doc.rev_id,
                        i32::from(doc.deleted),
                        doc.body.len(),
                    ])
                })
                .collect();
            let (inbound, reply_rx) = Inbound::request(
                Message::new(Profile::Changes).with_json(&serde_json::Value::Array(body)),
            );
            if self.inbound_tx.send(inbound).is_err() {
                return;
            }
            let Ok(reply) = reply_rx.recv() else {
                return;
            };
            let answers = match reply.json_body() {
                Ok(serde_json::Value::Array(answers)) => answers,
                _ => return,
            };

            for (i, (seq, doc, doc_id)) in entries.iter().enumerate() {
                let wanted = matches!(answers.get(i), Some(serde_json::Value::Array(_)));
                if !wanted {
                    continue;
                }
                let mut message = Message::new(Profile::Rev)
                    .with_property("id", doc_id)
                    .with_property("rev", &doc.rev_id)
                    .with_property("sequence", seq.to_string());
                if doc.deleted {
                    message = message.with_property("deleted", "true");
                }
                if !doc.history.is_empty() {
                    message = message.with_property("history", doc.history.join(","));
                }
                let (inbound, ack_rx) = Inbound::request(message.with_body(doc.body.clone()));
                if self.inbound_tx.send(inbound).is_err() {
                    return;
                }
                // Wait for the insert to commit so delivery is ordered.
                let _ = ack_rx.recv();
            }
        }

        // Empty changes announcement: the subscriber is caught up.
        let _ = self
            .inbound_tx
            .send(Inbound::notification(Message::new(Profile::Changes)));
    }
}

impl Transport for LoopbackPeer {
    fn send_request(&self, message: Message, on_response: ResponseCallback) -> ReplResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplError::transport_fatal("connection closed"));
        }
        let reply = self.handle(&message);
        on_response(Ok(reply));
        Ok(())
    }

    fn send_no_reply(&self, message: Message) -> ReplResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplError::transport_fatal("connection closed"));
        }
        let _ = self.handle(&message);
        Ok(())
    }

    fn cancel_pending(&self) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
