//! Shared property-key dictionary.

use crate::error::{CodecError, CodecResult};
use std::collections::HashMap;

/// Maximum number of keys a dictionary will intern.
const MAX_SHARED_KEYS: usize = 2048;

/// Maximum length of a key eligible for interning.
const MAX_KEY_LENGTH: usize = 16;

/// A per-database dictionary mapping small integer IDs to property names.
///
/// Documents in a database share property names heavily, so the encoder
/// replaces eligible map keys with interned IDs. Eligibility is
/// conservative (short, alphanumeric) so that arbitrary user data never
/// pollutes the table; the table only grows, and IDs are stable for the
/// lifetime of the database.
#[derive(Debug, Default, Clone)]
pub struct SharedKeys {
    by_id: Vec<String>,
    by_key: HashMap<String, u16>,
}

impl SharedKeys {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a dictionary from its key list, in ID order.
    pub fn from_keys(keys: Vec<String>) -> Self {
        let by_key = keys
            .iter()
            .enumerate()
            .map(|(id, k)| (k.clone(), id as u16))
            .collect();
        Self { by_id: keys, by_key }
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if no keys are interned.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The full key list, in ID order.
    pub fn keys(&self) -> &[String] {
        &self.by_id
    }

    /// Returns the ID for `key`, interning it if eligible and not present.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::SharedKeyRejected`] if the key is not eligible
    /// or the table is full.
    pub fn intern(&mut self, key: &str) -> CodecResult<u16> {
        if let Some(&id) = self.by_key.get(key) {
            return Ok(id);
        }
        if !Self::is_eligible(key) || self.by_id.len() >= MAX_SHARED_KEYS {
            return Err(CodecError::SharedKeyRejected {
                key: key.to_string(),
            });
        }
        let id = self.by_id.len() as u16;
        self.by_id.push(key.to_string());
        self.by_key.insert(key.to_string(), id);
        Ok(id)
    }

    /// Looks up the ID for an already-interned key.
    pub fn id_for_key(&self, key: &str) -> Option<u16> {
        self.by_key.get(key).copied()
    }

    /// Looks up the key for an ID.
    pub fn key_for_id(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.by_id.get(i))
            .map(String::as_str)
    }

    fn is_eligible(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_KEY_LENGTH
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }
}
