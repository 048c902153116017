//! Replication checkpoints.

use crate::error::{ReplError, ReplResult};
use crate::options::ReplicatorOptions;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol version, part of the checkpoint key so incompatible sessions
/// never share resumption state.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reserved raw-document namespace for local checkpoints.
pub const CHECKPOINT_NAMESPACE: &str = "checkpoints";

/// A resumption marker for one replication channel.
///
/// Two counters: the last local sequence fully pushed, and an opaque
/// cursor naming the last revision pulled. The checkpoint exists in two
/// mirrored copies, one local and one on the peer; when they disagree the
/// session resets rather than trusting either blindly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last local sequence acknowledged by the peer.
    #[serde(default)]
    pub local_seq: u64,
    /// Opaque cursor for the last revision pulled.
    #[serde(default)]
    pub remote_cursor: String,
}

impl Checkpoint {
    /// Serializes to the JSON body stored locally and on the peer.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parses a stored checkpoint body.
    ///
    /// # Errors
    ///
    /// A checkpoint that does not parse is treated as a mismatch by the
    /// caller, so the error type is [`ReplError::CheckpointMismatch`].
    pub fn from_bytes(bytes: &[u8]) -> ReplResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| ReplError::CheckpointMismatch)
    }
}

/// Computes the checkpoint document ID for a replication channel.
///
/// A stable digest over the local database UUID, the remote URL, the
/// filtering options, and the protocol version.
pub fn checkpoint_id(db_uuid: &[u8; 16], remote_url: &str, options: &ReplicatorOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(db_uuid);
    hasher.update([0]);
    hasher.update(remote_url.as_bytes());
    hasher.update([0]);
    hasher.update(options.filter_digest().as_bytes());
    hasher.update([0]);
    hasher.update(PROTOCOL_VERSION.to_be_bytes());
    let digest = hasher.finalize();
    format!(
        "cp-{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&digest[..18])
    )
}

/// Reconciles the local and remote checkpoint copies at startup.
///
/// Missing remote: the peer has never seen this session, so everything
/// starts from zero. Mismatched copies with both present: the peer's copy
/// is the truth for the pull cursor, and push restarts from zero, which
/// is safe because the revision trees reject duplicates. A missing local
/// copy resets everything; a remote cursor cannot be trusted against a
/// database that never produced it.
pub fn reconcile(local: Option<&Checkpoint>, remote: Option<&Checkpoint>) -> Checkpoint {
    match (local, remote) {
        (Some(local), Some(remote)) if local == remote => local.clone(),
        (Some(_), Some(remote)) => Checkpoint {
            local_seq: 0,
            remote_cursor: remote.remote_cursor.clone(),
        },
        _ => Checkpoint::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ReplMode;

    #[test]
    fn body_roundtrip() {
        let checkpoint = Checkpoint {
            local_seq: 42,
            remote_cursor: "88-abc".to_string(),
        };
        let restored = Checkpoint::from_bytes(&checkpoint.to_bytes()).unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn missing_fields_default() {
        let checkpoint = Checkpoint::from_bytes(b"{}").unwrap();
        assert_eq!(checkpoint, Checkpoint::default());
    }

    #[test]
    fn garbage_is_mismatch() {
        assert!(matches!(
            Checkpoint::from_bytes(b"not json"),
            Err(ReplError::CheckpointMismatch)
        ));
    }

    #[test]
    fn key_is_stable_and_discriminating() {
        let uuid = [7u8; 16];
        let options = ReplicatorOptions::new();
        let a = checkpoint_id(&uuid, "wss://h/db", &options);
        let b = checkpoint_id(&uuid, "wss://h/db", &options);
        assert_eq!(a, b);
        assert!(a.starts_with("cp-"));

        assert_ne!(a, checkpoint_id(&[8u8; 16], "wss://h/db", &options));
        assert_ne!(a, checkpoint_id(&uuid, "wss://other/db", &options));
        assert_ne!(
            a,
            checkpoint_id(
                &uuid,
                "wss://h/db",
                &ReplicatorOptions::new().with_doc_ids(["only".to_string()])
            )
        );
        // Direction modes do not affect the key.
        assert_eq!(
            a,
            checkpoint_id(
                &uuid,
                "wss://h/db",
                &ReplicatorOptions::new().with_push(ReplMode::Continuous)
            )
        );
    }

    #[test]
    fn reconcile_rules() {
        let local = Checkpoint {
            local_seq: 10,
            remote_cursor: "5".into(),
        };

        // Agreement resumes.
        assert_eq!(reconcile(Some(&local), Some(&local)), local);

        // Missing remote resets.
        assert_eq!(reconcile(Some(&local), None), Checkpoint::default());

        // Disagreement: the peer's pull cursor wins, push restarts.
        let other = Checkpoint {
            local_seq: 3,
            remote_cursor: "8".into(),
        };
        assert_eq!(
            reconcile(Some(&local), Some(&other)),
            Checkpoint {
                local_seq: 0,
                remote_cursor: "8".into(),
            }
        );

        // A missing local copy never trusts the remote cursor.
        assert_eq!(reconcile(None, Some(&other)), Checkpoint::default());

        // Fresh session starts at zero.
        assert_eq!(reconcile(None, None), Checkpoint::default());
    }
}
