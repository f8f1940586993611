use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use ocmmodel::access::AccessSpec;
use ocmmodel::descriptor::Resource;
use ocmmodel::digest::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadDigest(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Normalizes the digest of a resource for one access kind, e.g. pinning an
/// OCI image resource to its manifest digest so the same image referenced
/// through different representations hashes identically.
#[async_trait]
pub trait DigestProcessor: Send + Sync {
    async fn process(&self, resource: &Resource) -> Result<Resource, Error>;
}

#[derive(Default)]
pub struct DigestProcessorRegistry {
    processors: HashMap<String, Arc<dyn DigestProcessor>>,
}

impl DigestProcessorRegistry {
    pub fn new() -> DigestProcessorRegistry {
        let mut r = DigestProcessorRegistry::default();
        r.register(
            ocmmodel::access::KIND_OCI_IMAGE,
            Arc::new(OciImageDigestProcessor),
        );
        r
    }

    pub fn register(&mut self, kind: impl Into<String>, processor: Arc<dyn DigestProcessor>) {
        self.processors.insert(kind.into(), processor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DigestProcessor>> {
        self.processors
            .get(kind)
            .or_else(|| {
                // fall back to the unversioned kind
                let bare = kind.split('/').next().unwrap_or(kind);
                self.processors
                    .iter()
                    .find(|(k, _)| k.split('/').next().unwrap_or(k) == bare)
                    .map(|(_, v)| v)
            })
            .cloned()
    }
}

/// If the image reference is pinned (`...@sha256:...`), that manifest digest
/// is the canonical digest of the resource.
struct OciImageDigestProcessor;

#[async_trait]
impl DigestProcessor for OciImageDigestProcessor {
    async fn process(&self, resource: &Resource) -> Result<Resource, Error> {
        let Some(AccessSpec::OciImage { image_reference }) = &resource.access else {
            return Ok(resource.clone());
        };
        let Some((_, digest_str)) = image_reference.split_once('@') else {
            return Ok(resource.clone());
        };
        let digest: Digest = digest_str
            .parse()
            .map_err(|_| Error::BadDigest(digest_str.to_string()))?;
        let mut updated = resource.clone();
        updated.digest = Some(digest);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmmodel::descriptor::Relation;

    fn resource(reference: &str) -> Resource {
        Resource {
            name: "image".to_string(),
            version: "v1".to_string(),
            typ: "ociImage".to_string(),
            relation: Relation::External,
            access: Some(AccessSpec::oci_image(reference)),
            digest: None,
            creation_time: None,
            labels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_pinned_reference_sets_digest() {
        let registry = DigestProcessorRegistry::new();
        let p = registry.get("ociImage/v1").unwrap();
        let digest = Digest::sha256_of("manifest");
        let r = resource(&format!("ghcr.io/acme/app:1.0@{digest}"));
        let processed = p.process(&r).await.unwrap();
        assert_eq!(processed.digest, Some(digest));
    }

    #[tokio::test]
    async fn test_unpinned_reference_untouched() {
        let registry = DigestProcessorRegistry::new();
        // unversioned lookup works too
        let p = registry.get("ociImage").unwrap();
        let r = resource("ghcr.io/acme/app:1.0");
        let processed = p.process(&r).await.unwrap();
        assert_eq!(processed.digest, None);
    }
}
