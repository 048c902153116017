//! Content-addressed blob store.

use crate::error::{StoreError, StoreResult};
use base64::Engine;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A blob's content address: the SHA-256 of its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobKey([u8; 32]);

impl BlobKey {
    /// Computes the key for the given contents.
    pub fn for_contents(contents: &[u8]) -> Self {
        let digest = Sha256::digest(contents);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sha256-{}",
            base64::engine::general_purpose::STANDARD.encode(self.0)
        )
    }
}

impl FromStr for BlobKey {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        let encoded = s
            .strip_prefix("sha256-")
            .ok_or_else(|| StoreError::InvalidBlobKey {
                input: s.to_string(),
            })?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| StoreError::InvalidBlobKey {
                input: s.to_string(),
            })?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| StoreError::InvalidBlobKey {
                input: s.to_string(),
            })?;
        Ok(Self(bytes))
    }
}

/// Thread-safe content-addressed blob storage.
///
/// Writes are idempotent: storing the same bytes twice yields the same key
/// and keeps one copy. The store is shared by reference between the DB
/// actor and attachment handling, with no external locking required.
#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl BlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `contents`, returning its key.
    pub fn put(&self, contents: &[u8]) -> BlobKey {
        let key = BlobKey::for_contents(contents);
        self.blobs
            .write()
            .entry(key)
            .or_insert_with(|| contents.to_vec());
        key
    }

    /// Retrieves a blob's contents.
    ///
    /// # Errors
    ///
    /// [`StoreError::BlobNotFound`] if no blob has this key.
    pub fn get(&self, key: &BlobKey) -> StoreResult<Vec<u8>> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound {
                key: key.to_string(),
            })
    }

    /// True if the store holds a blob with this key.
    pub fn has(&self, key: &BlobKey) -> bool {
        self.blobs.read().contains_key(key)
    }

    /// The size of a blob, if present.
    pub fn size_of(&self, key: &BlobKey) -> Option<usize> {
        self.blobs.read().get(key).map(Vec::len)
    }

    /// Removes a blob.
    pub fn delete(&self, key: &BlobKey) {
        self.blobs.write().remove(key);
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// True if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let store = BlobStore::new();
        let key = store.put(b"attachment bytes");
        assert_eq!(store.get(&key).unwrap(), b"attachment bytes");
        assert_eq!(store.size_of(&key), Some(16));
    }

    #[test]
    fn put_is_idempotent() {
        let store = BlobStore::new();
        let a = store.put(b"same");
        let b = store.put(b"same");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn key_string_roundtrip() {
        let key = BlobKey::for_contents(b"x");
        let text = key.to_string();
        assert!(text.starts_with("sha256-"));
        assert_eq!(text.parse::<BlobKey>().unwrap(), key);
    }

    #[test]
    fn rejects_bad_key_strings() {
        assert!("md5-abc".parse::<BlobKey>().is_err());
        assert!("sha256-!!!".parse::<BlobKey>().is_err());
        assert!("sha256-AQID".parse::<BlobKey>().is_err());
    }

    #[test]
    fn missing_blob_errors() {
        let store = BlobStore::new();
        let key = BlobKey::for_contents(b"never stored");
        assert!(matches!(
            store.get(&key),
            Err(StoreError::BlobNotFound { .. })
        ));
    }
}
