use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const ATTR_TYPE: &str = "type";
pub const ATTR_SCHEME: &str = "scheme";
pub const ATTR_HOSTNAME: &str = "hostname";
pub const ATTR_PORT: &str = "port";
pub const ATTR_PATH: &str = "path";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    EmptyUrl,
    EmptyHost,
    BadPort(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered attribute map used to match credentials and caches to endpoints.
/// Insertion order is preserved for display, but equality and hashing are
/// attribute-wise so two identities with the same attributes in different
/// order are the same key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity(IndexMap<String, String>);

impl Identity {
    pub fn new() -> Identity {
        Identity::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Identity {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Subset match: every attribute of `self` exists in `candidate` with an
    /// equal value. An empty identity matches everything.
    pub fn subset_of(&self, candidate: &Identity) -> bool {
        self.0
            .iter()
            .all(|(k, v)| candidate.0.get(k).is_some_and(|c| c == v))
    }

    /// Parse `scheme://host[:port][/path]` into scheme/hostname/port/path
    /// attributes. The scheme is optional; a bare `host:port/path` works too.
    pub fn from_url(url: &str) -> Result<Identity, Error> {
        if url.is_empty() {
            return Err(Error::EmptyUrl);
        }
        let (scheme, rest) = match url.split_once("://") {
            Some((s, r)) => (Some(s), r),
            None => (None, url),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (rest, None),
        };
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::BadPort(p.to_string()));
                }
                (h, Some(p))
            }
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(Error::EmptyHost);
        }
        let mut id = Identity::new();
        if let Some(scheme) = scheme {
            id.set(ATTR_SCHEME, scheme);
        }
        id.set(ATTR_HOSTNAME, host);
        if let Some(port) = port {
            id.set(ATTR_PORT, port);
        }
        if let Some(path) = path
            && !path.is_empty()
        {
            id.set(ATTR_PATH, path);
        }
        Ok(id)
    }

    /// Stable sorted `k=v,k=v` form, usable as a map key or log tag.
    pub fn canonical_string(&self) -> String {
        let mut pairs: Vec<_> = self.0.iter().collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Identity) -> bool {
        self.0.len() == other.0.len() && self.subset_of(other)
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // hash in sorted order so insertion order doesn't matter
        let mut pairs: Vec<_> = self.0.iter().collect();
        pairs.sort();
        for (k, v) in pairs {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl FromIterator<(String, String)> for Identity {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Identity {
        Identity(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url() {
        let id = Identity::from_url("https://example.com:443/my/repo").unwrap();
        assert_eq!(id.get(ATTR_SCHEME), Some("https"));
        assert_eq!(id.get(ATTR_HOSTNAME), Some("example.com"));
        assert_eq!(id.get(ATTR_PORT), Some("443"));
        assert_eq!(id.get(ATTR_PATH), Some("my/repo"));

        let id = Identity::from_url("example.com").unwrap();
        assert_eq!(id.get(ATTR_HOSTNAME), Some("example.com"));
        assert_eq!(id.get(ATTR_PORT), None);

        assert_eq!(Identity::from_url(""), Err(Error::EmptyUrl));
        assert!(matches!(
            Identity::from_url("host:notaport/x"),
            Err(Error::BadPort(_))
        ));
    }

    #[test]
    fn test_eq_ignores_order() {
        let a = Identity::new().with("hostname", "h").with("port", "443");
        let b = Identity::new().with("port", "443").with("hostname", "h");
        assert_eq!(a, b);
        assert_eq!(a.canonical_string(), b.canonical_string());
    }

    #[test]
    fn test_subset() {
        let query = Identity::new().with("hostname", "example.com");
        let candidate = Identity::new()
            .with("hostname", "example.com")
            .with("port", "443");
        assert!(query.subset_of(&candidate));
        assert!(!candidate.subset_of(&query));
        assert!(Identity::new().subset_of(&candidate));
        let wrong = Identity::new().with("hostname", "other.com");
        assert!(!wrong.subset_of(&candidate));
    }
}
