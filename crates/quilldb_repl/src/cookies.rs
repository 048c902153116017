//! HTTP cookie storage for replication sessions.

use crate::address::Address;
use parking_lot::Mutex;
use quilldb_codec::{decode, encode, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// An HTTP cookie.
///
/// Construction never fails; invalid input yields a cookie for which
/// [`Cookie::valid`] returns false, and the store refuses those.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name. Empty means invalid.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Domain the cookie applies to.
    pub domain: String,
    /// Path prefix the cookie applies to.
    pub path: String,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Expiry time, seconds since the epoch; 0 means session-only.
    pub expires: i64,
    /// Only send over TLS.
    pub secure: bool,
}

impl Cookie {
    /// Parses a `Set-Cookie` header value received from `from_host`.
    ///
    /// A missing `Domain` attribute defaults to the source host; a
    /// `Domain` that does not cover the source host invalidates the
    /// cookie. `Max-Age` wins over `Expires` when both are present.
    pub fn parse(header: &str, from_host: &str) -> Self {
        let mut parts = header.split(';');
        let Some(first) = parts.next() else {
            return Cookie::default();
        };
        let Some((name, value)) = first.split_once('=') else {
            return Cookie::default();
        };

        let mut cookie = Cookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            domain: String::new(),
            path: "/".to_string(),
            created: now(),
            expires: 0,
            secure: false,
        };

        let mut max_age: Option<i64> = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = val.trim_start_matches('.').to_ascii_lowercase(),
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = val.to_string();
                    }
                }
                "expires" => {
                    if let Some(ts) = parse_http_date(val) {
                        cookie.expires = ts;
                    } else {
                        // An unparseable expiry invalidates the cookie
                        // rather than silently making it eternal.
                        cookie.name.clear();
                    }
                }
                "max-age" => {
                    if let Ok(secs) = val.parse::<i64>() {
                        max_age = Some(secs);
                    }
                }
                "secure" => cookie.secure = true,
                _ => {}
            }
        }

        if let Some(secs) = max_age {
            cookie.expires = now().saturating_add(secs);
        }

        if cookie.domain.is_empty() {
            cookie.domain = from_host.to_ascii_lowercase();
        } else if !domain_matches(&from_host.to_ascii_lowercase(), &cookie.domain) {
            // A host may not set cookies for an unrelated domain.
            cookie.name.clear();
        }

        cookie
    }

    /// True if the cookie parsed successfully.
    pub fn valid(&self) -> bool {
        !self.name.is_empty()
    }

    /// True if the cookie survives the session.
    pub fn persistent(&self) -> bool {
        self.expires > 0
    }

    /// True if the cookie has expired.
    pub fn expired(&self) -> bool {
        self.expires > 0 && self.expires < now()
    }

    /// True if both cookies occupy the same (name, domain, path) slot.
    pub fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    /// True if this cookie should be sent on a request to `address`.
    pub fn matches_address(&self, address: &Address) -> bool {
        domain_matches(&address.host, &self.domain)
            && path_matches(&address.path, &self.path)
            && (!self.secure || address.is_secure())
    }

    fn to_value(&self) -> Value {
        Value::map_from(vec![
            ("name", Value::Text(self.name.clone())),
            ("value", Value::Text(self.value.clone())),
            ("domain", Value::Text(self.domain.clone())),
            ("path", Value::Text(self.path.clone())),
            ("created", Value::Integer(self.created)),
            ("expires", Value::Integer(self.expires)),
            ("secure", Value::Bool(self.secure)),
        ])
    }

    fn from_value(value: &Value) -> Option<Self> {
        let text = |key: &str| value.get(key)?.as_text().map(str::to_string);
        Some(Cookie {
            name: text("name")?,
            value: text("value")?,
            domain: text("domain")?,
            path: text("path")?,
            created: value.get("created")?.as_integer()?,
            expires: value.get("expires")?.as_integer()?,
            secure: value.get("secure")?.as_bool()?,
        })
    }
}

/// RFC 6265 domain matching: equal, or `host` ends with `.domain`.
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || (host.len() > domain.len() && host.ends_with(domain) && {
        host.as_bytes()[host.len() - domain.len() - 1] == b'.'
    })
}

/// The cookie path must be a prefix of the request path, on a path
/// boundary.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if !request_path.starts_with(cookie_path) {
        return false;
    }
    cookie_path.ends_with('/')
        || request_path.len() == cookie_path.len()
        || request_path.as_bytes()[cookie_path.len()] == b'/'
}

fn parse_http_date(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.timestamp())
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct CookieJar {
    cookies: Vec<Cookie>,
    dirty: bool,
}

/// A thread-safe cookie store.
///
/// Holds at most one cookie per (name, domain, path); an equal-slot insert
/// replaces the prior cookie, and an empty-valued, already-expired insert
/// deletes it. The dirty flag is set on any mutation and cleared by the
/// consumer once it has persisted the store.
pub struct CookieStore {
    jar: Mutex<CookieJar>,
}

impl CookieStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            jar: Mutex::new(CookieJar {
                cookies: Vec::new(),
                dirty: false,
            }),
        }
    }

    /// Restores a store from encoded bytes. Unreadable data yields an
    /// empty store.
    pub fn from_encoded(data: &[u8]) -> Self {
        let store = Self::new();
        store.merge(data);
        store.clear_dirty();
        store
    }

    /// Parses and inserts a `Set-Cookie` header. Returns false for invalid
    /// cookies, which are not stored.
    pub fn set_cookie(&self, header: &str, from_host: &str) -> bool {
        let cookie = Cookie::parse(header, from_host);
        if !cookie.valid() {
            return false;
        }
        self.insert(cookie);
        true
    }

    /// Inserts a cookie, replacing any cookie in the same slot. An
    /// expired, empty-valued cookie acts as a deletion.
    pub fn insert(&self, cookie: Cookie) {
        let mut jar = self.jar.lock();
        jar.cookies.retain(|c| !c.same_slot(&cookie));
        if !(cookie.value.is_empty() && cookie.expired()) {
            jar.cookies.push(cookie);
        }
        jar.dirty = true;
    }

    /// The `Cookie:` header value for a request to `address`, or an empty
    /// string when nothing matches.
    pub fn cookies_for_request(&self, address: &Address) -> String {
        let jar = self.jar.lock();
        let mut header = String::new();
        for cookie in &jar.cookies {
            if cookie.expired() || !cookie.matches_address(address) {
                continue;
            }
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(&cookie.name);
            header.push('=');
            header.push_str(&cookie.value);
        }
        header
    }

    /// All cookies, for inspection.
    pub fn cookies(&self) -> Vec<Cookie> {
        self.jar.lock().cookies.clone()
    }

    /// Encodes the persistent subset for storage.
    pub fn encode(&self) -> Vec<u8> {
        let jar = self.jar.lock();
        let items: Vec<Value> = jar
            .cookies
            .iter()
            .filter(|c| c.persistent() && !c.expired())
            .map(Cookie::to_value)
            .collect();
        encode(&Value::Array(items))
    }

    /// Merges encoded cookies into this store; same-slot collisions keep
    /// the newer cookie.
    pub fn merge(&self, data: &[u8]) {
        let Ok(value) = decode(data) else {
            return;
        };
        let Some(items) = value.as_array() else {
            return;
        };
        for item in items {
            let Some(incoming) = Cookie::from_value(item) else {
                continue;
            };
            if !incoming.valid() || incoming.expired() {
                continue;
            }
            let mut jar = self.jar.lock();
            match jar.cookies.iter().position(|c| c.same_slot(&incoming)) {
                Some(i) if jar.cookies[i].created >= incoming.created => {}
                Some(i) => {
                    jar.cookies[i] = incoming;
                    jar.dirty = true;
                }
                None => {
                    jar.cookies.push(incoming);
                    jar.dirty = true;
                }
            }
        }
    }

    /// Removes all cookies.
    pub fn clear(&self) {
        let mut jar = self.jar.lock();
        if !jar.cookies.is_empty() {
            jar.cookies.clear();
            jar.dirty = true;
        }
    }

    /// True if the store has unpersisted changes.
    pub fn dirty(&self) -> bool {
        self.jar.lock().dirty
    }

    /// Marks the store as persisted.
    pub fn clear_dirty(&self) {
        self.jar.lock().dirty = false;
    }
}

impl Default for CookieStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(url: &str) -> Address {
        Address::parse(url).unwrap()
    }

    #[test]
    fn parse_basic_cookie() {
        let cookie = Cookie::parse("sid=42; Path=/; Max-Age=3600", "db.example.com");
        assert!(cookie.valid());
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "42");
        assert_eq!(cookie.domain, "db.example.com");
        assert_eq!(cookie.path, "/");
        assert!(cookie.persistent());
        assert!(!cookie.expired());
        assert!(!cookie.secure);
    }

    #[test]
    fn parse_attributes() {
        let cookie = Cookie::parse(
            "auth=tok; Domain=.example.com; Path=/db; Secure",
            "db.example.com",
        );
        assert!(cookie.valid());
        assert_eq!(cookie.domain, "example.com");
        assert_eq!(cookie.path, "/db");
        assert!(cookie.secure);
        assert!(!cookie.persistent());
    }

    #[test]
    fn parse_expires_date() {
        let cookie = Cookie::parse(
            "a=b; Expires=Wed, 09 Jun 2021 10:18:14 GMT",
            "db.example.com",
        );
        assert!(cookie.valid());
        assert_eq!(cookie.expires, 1623233894);
        assert!(cookie.expired());
    }

    #[test]
    fn max_age_wins_over_expires() {
        let cookie = Cookie::parse(
            "a=b; Expires=Wed, 09 Jun 2021 10:18:14 GMT; Max-Age=3600",
            "db.example.com",
        );
        assert!(!cookie.expired());
    }

    #[test]
    fn invalid_cookies() {
        assert!(!Cookie::parse("", "h").valid());
        assert!(!Cookie::parse("novalue", "h").valid());
        assert!(!Cookie::parse("a=b; Expires=garbage", "h").valid());
        // Foreign domain is rejected.
        assert!(!Cookie::parse("a=b; Domain=evil.com", "db.example.com").valid());
    }

    #[test]
    fn domain_matching() {
        assert!(domain_matches("db.example.com", "db.example.com"));
        assert!(domain_matches("db.example.com", "example.com"));
        assert!(!domain_matches("example.com", "db.example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
    }

    #[test]
    fn path_matching() {
        assert!(path_matches("/db/doc", "/"));
        assert!(path_matches("/db/doc", "/db"));
        assert!(path_matches("/db", "/db"));
        assert!(!path_matches("/dbx", "/db"));
        assert!(!path_matches("/", "/db"));
    }

    #[test]
    fn store_slot_uniqueness() {
        let store = CookieStore::new();
        store.set_cookie("sid=1; Max-Age=60", "h.example.com");
        store.set_cookie("sid=2; Max-Age=60", "h.example.com");
        let cookies = store.cookies();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "2");
    }

    #[test]
    fn expired_empty_insert_deletes() {
        let store = CookieStore::new();
        store.set_cookie("sid=1; Max-Age=60", "h.example.com");
        store.insert(Cookie {
            name: "sid".into(),
            value: String::new(),
            domain: "h.example.com".into(),
            path: "/".into(),
            created: now(),
            expires: 1,
            secure: false,
        });
        assert!(store.cookies().is_empty());
    }

    #[test]
    fn request_header_matching() {
        let store = CookieStore::new();
        store.set_cookie("sid=42; Path=/; Max-Age=3600", "db.example.com");
        store.set_cookie("other=x; Path=/elsewhere; Max-Age=3600", "db.example.com");
        store.set_cookie("tls=y; Secure; Max-Age=3600", "db.example.com");

        let plain = store.cookies_for_request(&addr("ws://db.example.com/foo"));
        assert_eq!(plain, "sid=42");

        let secure = store.cookies_for_request(&addr("wss://db.example.com/foo"));
        assert_eq!(secure, "sid=42; tls=y");

        let elsewhere = store.cookies_for_request(&addr("ws://db.example.com/elsewhere/x"));
        assert_eq!(elsewhere, "sid=42; other=x");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let store = CookieStore::new();
        store.set_cookie("sid=42; Path=/; Max-Age=3600; Secure", "db.example.com");
        store.set_cookie("session=tmp", "db.example.com"); // not persistent

        let restored = CookieStore::from_encoded(&store.encode());
        let cookies = restored.cookies();
        assert_eq!(cookies.len(), 1);
        let sid = &cookies[0];
        assert_eq!(sid.name, "sid");
        assert_eq!(sid.value, "42");
        assert_eq!(sid.domain, "db.example.com");
        assert_eq!(sid.path, "/");
        assert!(sid.secure);
        assert!(sid.persistent());
        assert!(!restored.dirty());
    }

    #[test]
    fn merge_keeps_newer() {
        let older = CookieStore::new();
        older.insert(Cookie {
            name: "sid".into(),
            value: "old".into(),
            domain: "h".into(),
            path: "/".into(),
            created: 100,
            expires: i64::MAX,
            secure: false,
        });

        let newer = CookieStore::new();
        newer.insert(Cookie {
            name: "sid".into(),
            value: "new".into(),
            domain: "h".into(),
            path: "/".into(),
            created: 200,
            expires: i64::MAX,
            secure: false,
        });

        newer.merge(&older.encode());
        assert_eq!(newer.cookies()[0].value, "new");

        let other = CookieStore::new();
        other.merge(&newer.encode());
        assert_eq!(other.cookies()[0].value, "new");
    }

    #[test]
    fn dirty_tracking() {
        let store = CookieStore::new();
        assert!(!store.dirty());
        store.set_cookie("a=b; Max-Age=10", "h");
        assert!(store.dirty());
        store.clear_dirty();
        assert!(!store.dirty());
        store.clear();
        assert!(store.dirty());
    }
}
