//! Revision identifiers.

use crate::error::{StoreError, StoreResult};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of hex characters of the digest kept in a revision ID.
const DIGEST_HEX_LEN: usize = 20;

/// A revision identifier: `<generation>-<digest>`.
///
/// The generation is the depth of the revision in its tree; the digest is
/// derived from the parent revision and the body, so two peers editing the
/// same parent identically produce the same ID. IDs order by generation
/// first, then by digest, which is the tie-break used to pick a winning
/// leaf deterministically on every peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    generation: u32,
    digest: String,
}

impl RevId {
    /// Creates a revision ID from its parts.
    pub fn new(generation: u32, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// Derives a child revision ID from its parent and body.
    pub fn derive(parent: Option<&RevId>, body: &[u8], deleted: bool) -> Self {
        let generation = parent.map_or(1, |p| p.generation + 1);

        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(body);
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(DIGEST_HEX_LEN);
        for byte in digest.iter().take(DIGEST_HEX_LEN / 2) {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self {
            generation,
            digest: hex,
        }
    }

    /// The generation number (1-based).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The digest portion.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevId {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        let (generation, digest) = s.split_once('-').ok_or_else(|| StoreError::InvalidRevId {
            input: s.to_string(),
        })?;
        let generation: u32 = generation.parse().map_err(|_| StoreError::InvalidRevId {
            input: s.to_string(),
        })?;
        if generation == 0 || digest.is_empty() {
            return Err(StoreError::InvalidRevId {
                input: s.to_string(),
            });
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format() {
        let rev: RevId = "3-deadbeef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "deadbeef");
        assert_eq!(rev.to_string(), "3-deadbeef");
    }

    #[test]
    fn rejects_malformed() {
        assert!("".parse::<RevId>().is_err());
        assert!("abc".parse::<RevId>().is_err());
        assert!("0-abc".parse::<RevId>().is_err());
        assert!("1-".parse::<RevId>().is_err());
        assert!("x-abc".parse::<RevId>().is_err());
    }

    #[test]
    fn derive_is_deterministic() {
        let a = RevId::derive(None, b"body", false);
        let b = RevId::derive(None, b"body", false);
        assert_eq!(a, b);
        assert_eq!(a.generation(), 1);

        let child = RevId::derive(Some(&a), b"body2", false);
        assert_eq!(child.generation(), 2);
        assert_ne!(child.digest(), a.digest());
    }

    #[test]
    fn derive_differs_on_deletion() {
        let parent = RevId::derive(None, b"body", false);
        let tombstone = RevId::derive(Some(&parent), b"", true);
        let edit = RevId::derive(Some(&parent), b"", false);
        assert_ne!(tombstone, edit);
    }

    #[test]
    fn ordering_by_generation_then_digest() {
        let a: RevId = "1-zzz".parse().unwrap();
        let b: RevId = "2-aaa".parse().unwrap();
        let c: RevId = "2-bbb".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
