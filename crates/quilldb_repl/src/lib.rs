//! # QuillDB Replicator
//!
//! Peer-to-peer synchronization of document revisions between a local
//! store and a remote peer over a full-duplex framed message transport.
//!
//! The engine is a set of cooperating actors, each a thread draining a
//! mailbox of tagged messages:
//!
//! - [`Replicator`] — the coordinator: lifecycle, status rollup,
//!   checkpoint management.
//! - The database actor — exclusive owner of all store access, including
//!   the batched insert path.
//! - The pusher — local-to-remote revision flow with windowed sends and
//!   contiguous-acknowledgement checkpointing.
//! - The puller — remote-to-local flow, advancing its cursor only as
//!   insert transactions commit.
//!
//! Suspension points exist only at message boundaries and transport
//! completions, so each handler runs to completion without blocking I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod batcher;
mod checkpoint;
mod cookies;
mod db_actor;
mod error;
pub mod loopback;
mod message;
mod options;
mod puller;
mod pusher;
mod replicator;
mod status;
mod transport;
mod types;

pub use address::Address;
pub use batcher::{InsertBatcher, Nudge, INSERT_BATCH_DELAY, INSERT_BATCH_LIMIT};
pub use checkpoint::{checkpoint_id, Checkpoint, CHECKPOINT_NAMESPACE, PROTOCOL_VERSION};
pub use cookies::{Cookie, CookieStore};
pub use db_actor::COOKIE_NAMESPACE;
pub use error::{ReplError, ReplResult};
pub use message::{Message, Profile};
pub use options::{ReplMode, ReplicatorOptions, RetryConfig};
pub use pusher::MAX_OUTSTANDING_REVS;
pub use replicator::{Replicator, ReplicatorContext};
pub use status::{ActivityLevel, ActorKind, Progress, ReplicatorStatus};
pub use transport::{Inbound, Responder, ResponseCallback, Transport};
pub use types::{DocError, RevRequest, RevToInsert};
