//! Replicator configuration.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Replication direction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplMode {
    /// Direction disabled.
    #[default]
    Disabled,
    /// Replicate once, then stop.
    OneShot,
    /// Keep replicating until stopped.
    Continuous,
}

impl ReplMode {
    /// True unless disabled.
    pub fn is_active(self) -> bool {
        self != ReplMode::Disabled
    }

    /// True for continuous mode.
    pub fn is_continuous(self) -> bool {
        self == ReplMode::Continuous
    }
}

/// Configuration for retry behavior on transient connection errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Cap on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt count.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(64),
            backoff_multiplier: 2.0,
        }
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the given attempt (0-indexed), jittered up to 25%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25 * rand::random::<f64>();
        Duration::from_secs_f64(capped + jitter)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Options recognized by the replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    /// Push direction mode.
    pub push: ReplMode,
    /// Pull direction mode.
    pub pull: ReplMode,
    /// Restrict replication to these document IDs.
    pub doc_ids: Option<HashSet<String>>,
    /// Named server-side filter for pull.
    pub filter: Option<String>,
    /// Parameters for the filter.
    pub filter_params: BTreeMap<String, String>,
    /// Keep-alive interval advertised to the peer.
    pub heartbeat: Duration,
    /// Refuse conflicting inserts and propose changes before pushing.
    pub no_conflicts: bool,
    /// Change-feed batch size for push.
    pub changes_batch_size: usize,
    /// Retry behavior for transient connection errors.
    pub retry: RetryConfig,
    /// Identifier of this remote in the store's ancestor markers.
    pub remote_id: u64,
}

impl ReplicatorOptions {
    /// Creates options with both directions disabled.
    pub fn new() -> Self {
        Self {
            push: ReplMode::Disabled,
            pull: ReplMode::Disabled,
            doc_ids: None,
            filter: None,
            filter_params: BTreeMap::new(),
            heartbeat: Duration::from_secs(300),
            no_conflicts: false,
            changes_batch_size: 200,
            retry: RetryConfig::default(),
            remote_id: 1,
        }
    }

    /// Sets the push mode.
    pub fn with_push(mut self, mode: ReplMode) -> Self {
        self.push = mode;
        self
    }

    /// Sets the pull mode.
    pub fn with_pull(mut self, mode: ReplMode) -> Self {
        self.pull = mode;
        self
    }

    /// Restricts replication to the given document IDs.
    pub fn with_doc_ids<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.doc_ids = Some(ids.into_iter().collect());
        self
    }

    /// Sets the pull filter and its parameters.
    pub fn with_filter(
        mut self,
        name: impl Into<String>,
        params: BTreeMap<String, String>,
    ) -> Self {
        self.filter = Some(name.into());
        self.filter_params = params;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Enables no-conflicts mode.
    pub fn with_no_conflicts(mut self) -> Self {
        self.no_conflicts = true;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Digest over the filtering options.
    ///
    /// Feeds the checkpoint key: sessions with different filters must not
    /// share resumption state.
    pub fn filter_digest(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(ids) = &self.doc_ids {
            let mut sorted: Vec<&String> = ids.iter().collect();
            sorted.sort();
            for id in sorted {
                hasher.update(id.as_bytes());
                hasher.update([0]);
            }
        }
        if let Some(filter) = &self.filter {
            hasher.update(filter.as_bytes());
            hasher.update([1]);
        }
        for (k, v) in &self.filter_params {
            hasher.update(k.as_bytes());
            hasher.update([2]);
            hasher.update(v.as_bytes());
            hasher.update([3]);
        }
        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_predicates() {
        assert!(!ReplMode::Disabled.is_active());
        assert!(ReplMode::OneShot.is_active());
        assert!(ReplMode::Continuous.is_active());
        assert!(ReplMode::Continuous.is_continuous());
        assert!(!ReplMode::OneShot.is_continuous());
    }

    #[test]
    fn builder() {
        let options = ReplicatorOptions::new()
            .with_push(ReplMode::OneShot)
            .with_pull(ReplMode::Continuous)
            .with_heartbeat(Duration::from_secs(30))
            .with_no_conflicts();
        assert_eq!(options.push, ReplMode::OneShot);
        assert_eq!(options.pull, ReplMode::Continuous);
        assert_eq!(options.heartbeat, Duration::from_secs(30));
        assert!(options.no_conflicts);
    }

    #[test]
    fn filter_digest_depends_on_filters_only() {
        let base = ReplicatorOptions::new();
        let pushed = ReplicatorOptions::new().with_push(ReplMode::OneShot);
        assert_eq!(base.filter_digest(), pushed.filter_digest());

        let filtered = ReplicatorOptions::new().with_doc_ids(["a".to_string()]);
        assert_ne!(base.filter_digest(), filtered.filter_digest());
    }

    #[test]
    fn filter_digest_is_order_independent_for_doc_ids() {
        let a = ReplicatorOptions::new().with_doc_ids(["x".to_string(), "y".to_string()]);
        let b = ReplicatorOptions::new().with_doc_ids(["y".to_string(), "x".to_string()]);
        assert_eq!(a.filter_digest(), b.filter_digest());
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        let d1 = retry.delay_for_attempt(1);
        assert!(d1 >= Duration::from_millis(100) && d1 <= Duration::from_millis(125));
        // Capped at max_delay plus jitter.
        let d5 = retry.delay_for_attempt(5);
        assert!(d5 <= Duration::from_millis(500));
    }
}
