//! Remote peer addresses.

use crate::error::{ReplError, ReplResult};
use std::fmt;

/// A parsed remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// URL scheme (`ws`, `wss`, `http`, `https`).
    pub scheme: String,
    /// Host name.
    pub host: String,
    /// Port, defaulted from the scheme when absent.
    pub port: u16,
    /// Path, always starting with `/`.
    pub path: String,
}

impl Address {
    /// Parses an address from a URL string.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Protocol`] for URLs without a scheme or host.
    pub fn parse(url: &str) -> ReplResult<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ReplError::protocol(format!("address missing scheme: {url}")))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| ReplError::protocol(format!("bad port in address: {url}")))?,
            ),
            None => (authority, Self::default_port(scheme)),
        };
        if host.is_empty() {
            return Err(ReplError::protocol(format!("address missing host: {url}")));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
            path: path.to_string(),
        })
    }

    /// True for TLS schemes.
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "wss" | "https")
    }

    fn default_port(scheme: &str) -> u16 {
        match scheme {
            "wss" | "https" => 443,
            _ => 80,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme, self.host, self.port, self.path
        )
    }
}
