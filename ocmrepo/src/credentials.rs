use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use log::warn;

use ocmmodel::identity::Identity;

pub const KEY_USERNAME: &str = "username";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_REFRESH_TOKEN: &str = "refresh_token";
pub const KEY_ACCESS_TOKEN: &str = "access_token";

pub type Credentials = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Resolver(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The surrounding credential graph. Resolution happens on demand, right
/// before an operation that needs auth.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, identity: &Identity) -> Result<Option<Credentials>, Error>;
}

/// Static resolver over a list of `(identity, credentials)` pairs, matched
/// by subset. Enough for tests and for configurations loaded up front.
#[derive(Default)]
pub struct StaticCredentialResolver {
    entries: Vec<(Identity, Credentials)>,
}

impl StaticCredentialResolver {
    pub fn new() -> StaticCredentialResolver {
        StaticCredentialResolver::default()
    }

    pub fn with(mut self, identity: Identity, credentials: Credentials) -> Self {
        self.entries.push((identity, credentials));
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, identity: &Identity) -> Result<Option<Credentials>, Error> {
        Ok(self
            .entries
            .iter()
            .find(|(id, _)| identity.subset_of(id) || id.subset_of(identity))
            .map(|(_, c)| c.clone()))
    }
}

/// Shared credential cache keyed by consumer identity. Lookups are subset
/// matches (a query hits when all of its attributes are present in a cached
/// identity); inserts for an identity already cached overwrite in place,
/// with a warning when the credentials actually changed.
#[derive(Default)]
pub struct CredentialCache {
    entries: RwLock<Vec<(Identity, Credentials)>>,
}

impl CredentialCache {
    pub fn new() -> CredentialCache {
        CredentialCache::default()
    }

    pub fn add(&self, identity: Identity, credentials: Credentials) {
        let mut entries = self.entries.write().unwrap();
        if let Some((_, existing)) = entries.iter_mut().find(|(id, _)| *id == identity) {
            if *existing != credentials {
                warn!("overwriting cached credentials for {}", identity);
                *existing = credentials;
            }
            return;
        }
        entries.push((identity, credentials));
    }

    pub fn get(&self, query: &Identity) -> Option<Credentials> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|(id, _)| query.subset_of(id))
            .map(|(_, c)| c.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(user: &str) -> Credentials {
        Credentials::from([(KEY_USERNAME.to_string(), user.to_string())])
    }

    #[test]
    fn test_overwrite_in_place() {
        let cache = CredentialCache::new();
        let id = Identity::from_url("https://example.com:443").unwrap();
        cache.add(id.clone(), creds("u1"));
        cache.add(id.clone(), creds("u2"));
        assert_eq!(cache.len(), 1);

        let query = Identity::new()
            .with("hostname", "example.com")
            .with("port", "443");
        let got = cache.get(&query).unwrap();
        assert_eq!(got.get(KEY_USERNAME).map(String::as_str), Some("u2"));
    }

    #[test]
    fn test_subset_lookup_misses() {
        let cache = CredentialCache::new();
        cache.add(
            Identity::new().with("hostname", "example.com"),
            creds("u1"),
        );
        let other = Identity::new().with("hostname", "other.com");
        assert!(cache.get(&other).is_none());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticCredentialResolver::new().with(
            Identity::from_url("https://example.com").unwrap(),
            creds("u1"),
        );
        let query = Identity::new().with("hostname", "example.com");
        let got = resolver.resolve(&query).await.unwrap().unwrap();
        assert_eq!(got.get(KEY_USERNAME).map(String::as_str), Some("u1"));
        let miss = Identity::new().with("hostname", "nope.com");
        assert!(resolver.resolve(&miss).await.unwrap().is_none());
    }
}
