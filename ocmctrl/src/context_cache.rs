//! LRU-over-configuration-hash of reusable contexts and their sessions.
//! Keys are content hashes of the configuration objects (double hash across
//! the set) and of the raw repository spec bytes, so a changed secret or a
//! different target repository lands on a different cache entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use moka::sync::Cache;
use sha2::{Digest as _, Sha256};

/// A configuration object feeding a context: one secret or config map, its
/// data already decoded to strings.
#[derive(Debug, Clone)]
pub struct ConfigObject {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

/// Hash one object: keys in sorted order (the BTreeMap gives us that),
/// serialized as `key\0value\0`.
pub fn hash_config_object(object: &ConfigObject) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in &object.data {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Combine per-object digests: sort, concatenate, hash again.
pub fn hash_config_set(objects: &[ConfigObject]) -> String {
    let mut digests: Vec<String> = objects.iter().map(hash_config_object).collect();
    digests.sort();
    let mut hasher = Sha256::new();
    for digest in digests {
        hasher.update(digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn hash_repo_spec(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

pub fn session_key(config_hash: &str, repo_hash: &str) -> String {
    format!("{config_hash}@{repo_hash}")
}

/// Anything cached here owns resources that need closing on eviction.
pub trait Closeable: Send + Sync {
    /// Finalize; errors are the implementation's to log, eviction never
    /// propagates them.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Bounded cache of contexts (or sessions) keyed by configuration hash.
/// Eviction finalizes the entry off the caller's path; a hit on an entry
/// that was closed behind our back is replaced with a fresh one.
pub struct ContextCache<T: Closeable + 'static> {
    cache: Cache<String, Arc<T>>,
}

impl<T: Closeable + 'static> ContextCache<T> {
    pub fn new(capacity: u64) -> ContextCache<T> {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_listener(|key: Arc<String>, value: Arc<T>, cause| {
                info!("evicting cached context {} ({:?})", key, cause);
                value.close();
            })
            .build();
        ContextCache { cache }
    }

    pub fn get_or_create(&self, key: &str, create: impl FnOnce() -> Arc<T>) -> Arc<T> {
        if let Some(existing) = self.cache.get(key) {
            if !existing.is_closed() {
                return existing;
            }
            warn!("cached entry {} was closed, replacing", key);
            self.cache.invalidate(key);
        }
        let fresh = create();
        self.cache.insert(key.to_string(), fresh.clone());
        fresh
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key)
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Entry count after flushing pending maintenance, for the size gauges.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The outer cache of contexts plus the inner cache of sessions keyed by
/// `(config hash, repo-spec hash)`, with the size gauges wired up.
pub struct OcmContextCache<C: Closeable + 'static, S: Closeable + 'static> {
    contexts: ContextCache<C>,
    sessions: ContextCache<S>,
}

impl<C: Closeable + 'static, S: Closeable + 'static> OcmContextCache<C, S> {
    pub fn new(context_capacity: u64, session_capacity: u64) -> OcmContextCache<C, S> {
        OcmContextCache {
            contexts: ContextCache::new(context_capacity),
            sessions: ContextCache::new(session_capacity),
        }
    }

    pub fn context(&self, config_hash: &str, create: impl FnOnce() -> Arc<C>) -> Arc<C> {
        let context = self.contexts.get_or_create(config_hash, create);
        self.record_metrics();
        context
    }

    pub fn session(
        &self,
        config_hash: &str,
        repo_hash: &str,
        create: impl FnOnce() -> Arc<S>,
    ) -> Arc<S> {
        let session = self
            .sessions
            .get_or_create(&session_key(config_hash, repo_hash), create);
        self.record_metrics();
        session
    }

    pub fn record_metrics(&self) {
        crate::metrics::CONTEXT_CACHE_SIZE.set(self.contexts.len() as i64);
        crate::metrics::SESSION_CACHE_SIZE.set(self.sessions.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestSession {
        closed: AtomicBool,
    }

    impl TestSession {
        fn new() -> Arc<TestSession> {
            Arc::new(TestSession {
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Closeable for TestSession {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn object(name: &str, pairs: &[(&str, &str)]) -> ConfigObject {
        ConfigObject {
            name: name.to_string(),
            data: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = object("a", &[("x", "1"), ("y", "2")]);
        let b = object("b", &[("y", "2"), ("x", "1")]);
        // BTreeMap sorts keys, so the same pairs hash the same
        assert_eq!(hash_config_object(&a), hash_config_object(&b));

        // the set hash ignores object order too
        let c = object("c", &[("z", "3")]);
        assert_eq!(
            hash_config_set(&[a.clone(), c.clone()]),
            hash_config_set(&[c, a])
        );
    }

    #[test]
    fn test_hash_distinguishes_values() {
        let a = object("a", &[("x", "1")]);
        let b = object("a", &[("x", "2")]);
        assert_ne!(hash_config_object(&a), hash_config_object(&b));
        // key/value confusion is not possible thanks to the separators
        let kv = object("a", &[("xy", "z")]);
        let kv2 = object("a", &[("x", "yz")]);
        assert_ne!(hash_config_object(&kv), hash_config_object(&kv2));
    }

    #[test]
    fn test_get_or_create_reuses() {
        let cache: ContextCache<TestSession> = ContextCache::new(10);
        let first = cache.get_or_create("k", TestSession::new);
        let again = cache.get_or_create("k", || panic!("must not create"));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_closed_session_replaced_on_hit() {
        let cache: ContextCache<TestSession> = ContextCache::new(10);
        let first = cache.get_or_create("k", TestSession::new);
        first.close();
        let fresh = cache.get_or_create("k", TestSession::new);
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(!fresh.is_closed());
    }

    #[test]
    fn test_eviction_finalizes() {
        let cache: ContextCache<TestSession> = ContextCache::new(10);
        let session = cache.get_or_create("k", TestSession::new);
        cache.invalidate("k");
        cache.run_pending();
        assert!(session.is_closed());
    }

    impl<T: Closeable + 'static> ContextCache<T> {
        fn run_pending(&self) {
            self.cache.run_pending_tasks();
        }
    }

    #[test]
    fn test_outer_inner_caches() {
        let cache: OcmContextCache<TestSession, TestSession> = OcmContextCache::new(4, 8);
        let config = hash_config_set(&[object("a", &[("x", "1")])]);
        let repo = hash_repo_spec(b"type: OCIRepository/v1");
        let context = cache.context(&config, TestSession::new);
        let first = cache.session(&config, &repo, TestSession::new);
        let again = cache.session(&config, &repo, || panic!("must hit the cache"));
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!context.is_closed());
        // a different repo spec is a different session
        let other = cache.session(&config, &hash_repo_spec(b"other"), TestSession::new);
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_session_key() {
        let config = hash_config_set(&[object("a", &[("x", "1")])]);
        let repo = hash_repo_spec(b"type: OCIRepository/v1");
        let key = session_key(&config, &repo);
        assert!(key.contains('@'));
        assert_eq!(key.len(), 64 + 1 + 64);
    }
}
