//! Shared manifest and layer caches, injected into OCI repositories by the
//! provider so all repositories talking to the same endpoints reuse fetches.

use std::sync::Arc;

use bytes::Bytes;
use moka::future::Cache;

/// A cached manifest body with what the registry told us about it.
pub struct CachedManifest {
    pub media_type: String,
    pub digest: String,
    pub data: Bytes,
}

/// Keyed `authority/repo@reference` (tag or digest).
pub type ManifestCache = Cache<String, Arc<CachedManifest>>;

/// Keyed by blob digest; blobs are content-addressed so no repo in the key.
pub type LayerCache = Cache<String, Bytes>;

pub fn new_manifest_cache(capacity_bytes: u64) -> ManifestCache {
    Cache::builder()
        .max_capacity(capacity_bytes)
        .weigher(|k: &String, v: &Arc<CachedManifest>| {
            (k.len() + v.data.len()).try_into().unwrap_or(u32::MAX)
        })
        .build()
}

pub fn new_layer_cache(capacity_bytes: u64) -> LayerCache {
    Cache::builder()
        .max_capacity(capacity_bytes)
        .weigher(|k: &String, v: &Bytes| (k.len() + v.len()).try_into().unwrap_or(u32::MAX))
        .build()
}

pub fn manifest_key(authority: &str, repo: &str, reference: &str) -> String {
    format!("{}/{}@{}", authority, repo, reference)
}
