//! Replicator status reporting.

use crate::error::ReplError;
use crate::types::DocError;

/// How busy the replicator (or one of its actors) is.
///
/// Ordered so that a rollup is simply the maximum across sub-actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ActivityLevel {
    /// Finished or never started.
    #[default]
    Stopped,
    /// Disconnected, waiting to retry.
    Offline,
    /// Establishing the session.
    Connecting,
    /// Caught up; watching for more work.
    Idle,
    /// Actively transferring.
    Busy,
}

/// Transfer progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Units completed so far.
    pub completed: u64,
    /// Units known about in total.
    pub total: u64,
}

/// A snapshot of the replicator's externally visible state.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorStatus {
    /// Overall activity level.
    pub level: ActivityLevel,
    /// Push progress.
    pub progress: Progress,
    /// The fatal error that stopped the session, if any.
    pub error: Option<ReplError>,
    /// Per-document errors collected along the way. Never fatal.
    pub doc_errors: Vec<DocError>,
}

/// Identifies a sub-actor in status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    /// The database actor.
    Db,
    /// The pusher.
    Pusher,
    /// The puller.
    Puller,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order_for_rollup() {
        assert!(ActivityLevel::Stopped < ActivityLevel::Offline);
        assert!(ActivityLevel::Offline < ActivityLevel::Connecting);
        assert!(ActivityLevel::Connecting < ActivityLevel::Idle);
        assert!(ActivityLevel::Idle < ActivityLevel::Busy);

        let levels = [ActivityLevel::Idle, ActivityLevel::Busy, ActivityLevel::Stopped];
        assert_eq!(levels.iter().max(), Some(&ActivityLevel::Busy));
    }
}
