//! Wire messages for the framed transport.

use crate::error::{ReplError, ReplResult};

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Fetch the peer's copy of a checkpoint.
    GetCheckpoint,
    /// Store a checkpoint on the peer.
    SetCheckpoint,
    /// Subscribe to the peer's change feed.
    SubChanges,
    /// Announce a batch of changes.
    Changes,
    /// Propose changes before sending (no-conflicts mode).
    ProposedChanges,
    /// A document revision body.
    Rev,
    /// A revision that could not be sent.
    NoRev,
    /// A successful reply frame.
    Reply,
    /// An error reply frame.
    Error,
}

impl Profile {
    /// Wire name of this profile.
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::GetCheckpoint => "getCheckpoint",
            Profile::SetCheckpoint => "setCheckpoint",
            Profile::SubChanges => "subChanges",
            Profile::Changes => "changes",
            Profile::ProposedChanges => "proposedChanges",
            Profile::Rev => "rev",
            Profile::NoRev => "norev",
            Profile::Reply => "reply",
            Profile::Error => "error",
        }
    }

    /// Parses a wire profile name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "getCheckpoint" => Profile::GetCheckpoint,
            "setCheckpoint" => Profile::SetCheckpoint,
            "subChanges" => Profile::SubChanges,
            "changes" => Profile::Changes,
            "proposedChanges" => Profile::ProposedChanges,
            "rev" => Profile::Rev,
            "norev" => Profile::NoRev,
            "reply" => Profile::Reply,
            "error" => Profile::Error,
            _ => return None,
        })
    }
}

/// A framed message: a profile, a flat property dictionary, and an
/// optional body.
#[derive(Debug, Clone)]
pub struct Message {
    profile: Profile,
    properties: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Message {
    /// Creates an empty message of the given profile.
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            properties: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Creates a success reply.
    pub fn reply() -> Self {
        Self::new(Profile::Reply)
    }

    /// Creates an error reply with the conventional error properties.
    pub fn error(domain: &str, code: i32, message: &str) -> Self {
        Self::new(Profile::Error)
            .with_property("Error-Domain", domain)
            .with_property("Error-Code", code.to_string())
            .with_property("Error-Message", message)
    }

    /// The message profile.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Adds a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Sets the raw body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Sets a JSON body.
    pub fn with_json(self, value: &serde_json::Value) -> Self {
        self.with_body(value.to_string().into_bytes())
    }

    /// Looks up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Looks up an integer property.
    pub fn int_property(&self, key: &str) -> Option<i64> {
        self.property(key).and_then(|v| v.parse().ok())
    }

    /// Looks up a boolean property; absent means false.
    pub fn bool_property(&self, key: &str) -> bool {
        matches!(self.property(key), Some("true" | "1"))
    }

    /// The raw body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Malformed JSON in a message body is a protocol error.
    pub fn json_body(&self) -> ReplResult<serde_json::Value> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| ReplError::protocol(format!("bad {} body: {e}", self.profile.as_str())))
    }

    /// True for an error reply.
    pub fn is_error(&self) -> bool {
        self.profile == Profile::Error
    }

    /// Converts an error reply into a [`ReplError::Remote`].
    ///
    /// Returns `Ok(())` if the message is not an error.
    pub fn check_error(&self) -> ReplResult<()> {
        if !self.is_error() {
            return Ok(());
        }
        Err(ReplError::remote(
            self.property("Error-Domain").unwrap_or("web"),
            self.int_property("Error-Code").unwrap_or(500) as i32,
            self.property("Error-Message").unwrap_or("unknown"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_names_roundtrip() {
        for profile in [
            Profile::GetCheckpoint,
            Profile::SetCheckpoint,
            Profile::SubChanges,
            Profile::Changes,
            Profile::ProposedChanges,
            Profile::Rev,
            Profile::NoRev,
            Profile::Reply,
            Profile::Error,
        ] {
            assert_eq!(Profile::parse(profile.as_str()), Some(profile));
        }
        assert_eq!(Profile::parse("bogus"), None);
    }

    #[test]
    fn properties() {
        let msg = Message::new(Profile::Rev)
            .with_property("id", "doc1")
            .with_property("sequence", "42")
            .with_property("deleted", "true");
        assert_eq!(msg.property("id"), Some("doc1"));
        assert_eq!(msg.int_property("sequence"), Some(42));
        assert!(msg.bool_property("deleted"));
        assert!(!msg.bool_property("missing"));
    }

    #[test]
    fn json_body_roundtrip() {
        let msg = Message::new(Profile::Changes).with_json(&json!([[1, "a", "1-x"]]));
        assert_eq!(msg.json_body().unwrap(), json!([[1, "a", "1-x"]]));
    }

    #[test]
    fn empty_body_is_null() {
        let msg = Message::new(Profile::Changes);
        assert_eq!(msg.json_body().unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn malformed_body_is_protocol_error() {
        let msg = Message::new(Profile::Changes).with_body(b"{nope".to_vec());
        assert!(matches!(msg.json_body(), Err(ReplError::Protocol(_))));
    }

    #[test]
    fn error_replies() {
        let msg = Message::error("web", 404, "not found");
        assert!(msg.is_error());
        let err = msg.check_error().unwrap_err();
        assert_eq!(err, ReplError::remote("web", 404, "not found"));

        assert!(Message::reply().check_error().is_ok());
    }
}
