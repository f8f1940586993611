//! Caching repository provider: turns repository specifications into backend
//! repositories while guaranteeing one backend store per on-disk path and
//! sharing the credential, manifest and layer caches across everything it
//! hands out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, atomic::AtomicU64};

use log::{info, trace};

use ocmmodel::identity::Identity;
use ocmmodel::repospec::RepositorySpec;

use crate::caches::{LayerCache, ManifestCache, new_layer_cache, new_manifest_cache};
use crate::credentials::{CredentialCache, CredentialResolver};
use crate::ctf::{CtfRepository, CtfStore};
use crate::descriptor_cache::DescriptorCache;
use crate::oci::OciRepository;
use crate::ocidist::{Auth, Client, Registry};
use crate::repository::{ComponentVersionRepository, Error};

#[derive(Debug, Default)]
pub struct Stats {
    pub store_cache_hit: u64,
    pub store_cache_miss: u64,
    pub credential_cache_size: usize,
    pub store_cache_size: usize,
}

#[derive(Default)]
struct Counters {
    store_cache_hit: AtomicU64,
    store_cache_miss: AtomicU64,
}

pub struct RepositoryProvider {
    client: Client,
    resolver: Option<Arc<dyn CredentialResolver>>,
    // path -> the one store everybody shares; the mutex only guards the map,
    // stores serialize themselves
    stores: Mutex<HashMap<PathBuf, Arc<CtfStore>>>,
    credentials: CredentialCache,
    manifest_cache: ManifestCache,
    layer_cache: LayerCache,
    descriptor_cache: Arc<DescriptorCache>,
    counters: Counters,
}

impl RepositoryProvider {
    pub fn new(resolver: Option<Arc<dyn CredentialResolver>>) -> Result<RepositoryProvider, Error> {
        Ok(RepositoryProvider {
            client: Client::new()?,
            resolver,
            stores: Mutex::new(HashMap::new()),
            credentials: CredentialCache::new(),
            manifest_cache: new_manifest_cache(10_000_000),
            layer_cache: new_layer_cache(1_000_000_000),
            descriptor_cache: Arc::new(DescriptorCache::new()),
            counters: Counters::default(),
        })
    }

    pub fn credential_cache(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn descriptor_cache(&self) -> &Arc<DescriptorCache> {
        &self.descriptor_cache
    }

    /// Resolve a specification into a repository. CTF paths share a single
    /// store; OCI repositories share the HTTP client and all caches.
    pub async fn get_repository(
        &self,
        spec: &RepositorySpec,
    ) -> Result<Arc<dyn ComponentVersionRepository>, Error> {
        match spec {
            RepositorySpec::Ctf { path, access_mode } => {
                let store = self.load_or_store(path.clone(), *access_mode)?;
                Ok(Arc::new(CtfRepository::new(store)))
            }
            RepositorySpec::Oci { base_url } => {
                let identity = spec
                    .consumer_identity()
                    .map_err(|e| Error::InvalidAccess(e.to_string()))?;
                self.install_credentials(&identity).await?;
                let (registry, base_path) = Registry::parse_base_url(base_url)?;
                Ok(Arc::new(OciRepository::new(
                    self.client.clone(),
                    registry,
                    base_path,
                    self.manifest_cache.clone(),
                    self.layer_cache.clone(),
                    self.descriptor_cache.clone(),
                )))
            }
        }
    }

    /// Same as [get_repository](Self::get_repository) but typed for uploads:
    /// only the OCI backend can host external resources.
    pub async fn get_resource_repository(
        &self,
        spec: &RepositorySpec,
    ) -> Result<Arc<dyn crate::repository::ResourceRepository>, Error> {
        match spec {
            RepositorySpec::Oci { base_url } => {
                let identity = spec
                    .consumer_identity()
                    .map_err(|e| Error::InvalidAccess(e.to_string()))?;
                self.install_credentials(&identity).await?;
                let (registry, base_path) = Registry::parse_base_url(base_url)?;
                Ok(Arc::new(OciRepository::new(
                    self.client.clone(),
                    registry,
                    base_path,
                    self.manifest_cache.clone(),
                    self.layer_cache.clone(),
                    self.descriptor_cache.clone(),
                )))
            }
            RepositorySpec::Ctf { .. } => Err(Error::InvalidAccess(
                "a CTF archive cannot host external resources".to_string(),
            )),
        }
    }

    fn load_or_store(
        &self,
        path: PathBuf,
        mode: ocmmodel::repospec::AccessMode,
    ) -> Result<Arc<CtfStore>, Error> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(&path) {
            trace!("store cache hit {}", path.display());
            atomic_inc(&self.counters.store_cache_hit);
            return Ok(store.clone());
        }
        atomic_inc(&self.counters.store_cache_miss);
        info!("opening ctf store {}", path.display());
        let store = Arc::new(CtfStore::open(&path, mode)?);
        stores.insert(path, store.clone());
        Ok(store)
    }

    async fn install_credentials(&self, identity: &Identity) -> Result<(), Error> {
        let Some(resolver) = &self.resolver else {
            return Ok(());
        };
        let Some(credentials) = resolver
            .resolve(identity)
            .await
            .map_err(|e| Error::InvalidAccess(e.to_string()))?
        else {
            return Ok(());
        };
        if let Some(authority) = authority_of(identity) {
            self.client
                .add_auth(&authority, Auth::from_credentials(&credentials));
        }
        self.credentials.add(identity.clone(), credentials);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            store_cache_hit: atomic_take(&self.counters.store_cache_hit),
            store_cache_miss: atomic_take(&self.counters.store_cache_miss),
            credential_cache_size: self.credentials.len(),
            store_cache_size: self.stores.lock().unwrap().len(),
        }
    }
}

fn authority_of(identity: &Identity) -> Option<String> {
    let host = identity.get(ocmmodel::identity::ATTR_HOSTNAME)?;
    Some(match identity.get(ocmmodel::identity::ATTR_PORT) {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn atomic_inc(x: &AtomicU64) {
    x.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

fn atomic_take(x: &AtomicU64) -> u64 {
    x.swap(0, std::sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmmodel::repospec::AccessMode;

    #[tokio::test]
    async fn test_single_store_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctf");
        let provider = RepositoryProvider::new(None).unwrap();
        let spec = RepositorySpec::ctf(&path, AccessMode::RDWR | AccessMode::CREATE);

        let a = provider.get_repository(&spec).await.unwrap();
        let b = provider.get_repository(&spec).await.unwrap();

        // both handles share the same backing store: a write through one is
        // visible through the other without reopening
        let descriptor =
            ocmmodel::descriptor::ComponentDescriptor::new("c", "v1.0.0", "p");
        a.add_component_version(&descriptor).await.unwrap();
        let got = b.get_component_version("c", "v1.0.0").await.unwrap();
        assert_eq!(got, descriptor);

        let stats = provider.stats();
        assert_eq!(stats.store_cache_miss, 1);
        assert_eq!(stats.store_cache_hit, 1);
        assert_eq!(stats.store_cache_size, 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_share_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctf");
        let provider = Arc::new(RepositoryProvider::new(None).unwrap());
        let spec = RepositorySpec::ctf(&path, AccessMode::RDWR | AccessMode::CREATE);

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let provider = provider.clone();
            let spec = spec.clone();
            set.spawn(async move { provider.get_repository(&spec).await.map(|_| ()) });
        }
        while let Some(r) = set.join_next().await {
            r.unwrap().unwrap();
        }
        assert_eq!(provider.stats().store_cache_size, 1);
    }

    #[tokio::test]
    async fn test_ctf_cannot_host_external() {
        let dir = tempfile::tempdir().unwrap();
        let provider = RepositoryProvider::new(None).unwrap();
        let spec = RepositorySpec::ctf(
            dir.path().join("ctf"),
            AccessMode::RDWR | AccessMode::CREATE,
        );
        assert!(provider.get_resource_repository(&spec).await.is_err());
    }
}
