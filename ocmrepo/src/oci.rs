//! OCI-registry-backed component-version repository. A component version is
//! an index under tag `{version}` in `<base>/component-descriptors/<name>`;
//! local blobs are layers on the component manifest, resources with OCI
//! image access are linked as additional index entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{trace, warn};
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageIndex, ImageManifest, MediaType};

use ocmblob::{
    Blob, DigestPrecalculatable, MediaTypeAware, MediaTypeOverrideable, MemoryBlob,
};
use ocmmodel::access::AccessSpec;
use ocmmodel::descriptor::{ComponentDescriptor, Resource, Source};
use ocmmodel::digest::{Algorithm, Digest};
use ocmmodel::identity::Identity;

use crate::caches::{CachedManifest, LayerCache, ManifestCache, manifest_key};
use crate::descriptor_cache::DescriptorCache;
use crate::layout::{self, LayerRef};
use crate::ocidist::{
    ACCEPTED_IMAGE_INDEX, ACCEPTED_IMAGE_MANIFEST, Client, OCI_IMAGE_INDEX_V1,
    OCI_IMAGE_MANIFEST_V1, Registry,
};
use crate::repository::{ComponentVersionRepository, Error, ResourceRepository};

struct StagedBlob {
    size: u64,
    media_type: String,
}

pub struct OciRepository {
    client: Client,
    registry: Registry,
    base_path: String,
    manifest_cache: ManifestCache,
    layer_cache: LayerCache,
    descriptor_cache: Arc<DescriptorCache>,
    // local blobs pushed ahead of their descriptor, digest -> layer info
    staged: Mutex<HashMap<String, StagedBlob>>,
}

impl OciRepository {
    pub fn new(
        client: Client,
        registry: Registry,
        base_path: String,
        manifest_cache: ManifestCache,
        layer_cache: LayerCache,
        descriptor_cache: Arc<DescriptorCache>,
    ) -> OciRepository {
        OciRepository {
            client,
            registry,
            base_path,
            manifest_cache,
            layer_cache,
            descriptor_cache,
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_base_url(client: Client, base_url: &str) -> Result<OciRepository, Error> {
        let (registry, base_path) = Registry::parse_base_url(base_url)?;
        Ok(OciRepository::new(
            client,
            registry,
            base_path,
            crate::caches::new_manifest_cache(10_000_000),
            crate::caches::new_layer_cache(100_000_000),
            Arc::new(DescriptorCache::new()),
        ))
    }

    fn repo_path(&self, component: &str) -> String {
        if self.base_path.is_empty() {
            format!("{}/{}", crate::DESCRIPTOR_PATH_PREFIX, component)
        } else {
            format!(
                "{}/{}/{}",
                self.base_path,
                crate::DESCRIPTOR_PATH_PREFIX,
                component
            )
        }
    }

    async fn fetch_manifest_cached(
        &self,
        repo: &str,
        reference: &str,
        accept: &str,
    ) -> Result<Option<Arc<CachedManifest>>, Error> {
        let key = manifest_key(&self.registry.authority, repo, reference);
        if let Some(cached) = self.manifest_cache.get(&key).await {
            trace!("manifest cache hit {}", key);
            return Ok(Some(cached));
        }
        match self
            .client
            .get_manifest(&self.registry, repo, reference, accept)
            .await?
        {
            Some((media_type, digest, data)) => {
                let cached = Arc::new(CachedManifest {
                    media_type,
                    digest: digest.to_string(),
                    data,
                });
                self.manifest_cache.insert(key, cached.clone()).await;
                // also index it under the digest so by-digest reads hit
                let digest_key =
                    manifest_key(&self.registry.authority, repo, &cached.digest);
                self.manifest_cache.insert(digest_key, cached.clone()).await;
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    async fn fetch_layer_cached(
        &self,
        repo: &str,
        descriptor: &Descriptor,
    ) -> Result<Bytes, Error> {
        let key = descriptor.digest().to_string();
        if let Some(data) = self.layer_cache.get(&key).await {
            trace!("layer cache hit {}", key);
            return Ok(data);
        }
        let data = self
            .client
            .get_blob_bytes(&self.registry, repo, descriptor)
            .await?
            .ok_or_else(|| Error::LocalBlobNotFound {
                reference: key.clone(),
            })?;
        self.layer_cache.insert(key, data.clone()).await;
        Ok(data)
    }

    /// The component version's index and manifest, for descriptor and layer
    /// lookups.
    async fn load_manifest(
        &self,
        name: &str,
        version: &str,
    ) -> Result<(ImageIndex, ImageManifest), Error> {
        let repo = self.repo_path(name);
        let cached = self
            .fetch_manifest_cached(&repo, version, ACCEPTED_IMAGE_INDEX)
            .await?
            .ok_or_else(|| Error::ComponentVersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })?;
        if cached.media_type != OCI_IMAGE_INDEX_V1 {
            return Err(Error::CorruptLayout(format!(
                "expected image index under tag {version}, got {}",
                cached.media_type
            )));
        }
        let index = ImageIndex::from_reader(std::io::Cursor::new(&cached.data))?;
        self.descriptor_cache.put(
            manifest_key(&self.registry.authority, &repo, version),
            index.manifests().clone(),
        );

        let manifest_entry = layout::find_component_manifest(&index)?;
        let cached = self
            .fetch_manifest_cached(
                &repo,
                &manifest_entry.digest().to_string(),
                ACCEPTED_IMAGE_MANIFEST,
            )
            .await?
            .ok_or_else(|| {
                Error::CorruptLayout(format!("missing manifest {}", manifest_entry.digest()))
            })?;
        let manifest = ImageManifest::from_reader(std::io::Cursor::new(&cached.data))?;
        Ok((index, manifest))
    }

    async fn load_descriptor(
        &self,
        name: &str,
        version: &str,
    ) -> Result<(ComponentDescriptor, ImageManifest), Error> {
        let (_, manifest) = self.load_manifest(name, version).await?;
        let repo = self.repo_path(name);
        let layer = layout::find_descriptor_layer(&manifest)?;
        let data = self.fetch_layer_cached(&repo, layer).await?;
        Ok((layout::parse_descriptor(&data)?, manifest))
    }

    fn layer_for(&self, local_reference: &str) -> Result<LayerRef, Error> {
        let staged = self.staged.lock().unwrap();
        let blob = staged
            .get(local_reference)
            .ok_or_else(|| Error::LocalBlobNotFound {
                reference: local_reference.to_string(),
            })?;
        Ok(LayerRef {
            digest: local_reference
                .parse()
                .map_err(|_| Error::BadDigest(local_reference.to_string()))?,
            size: blob.size,
            media_type: blob.media_type.clone(),
        })
    }

    async fn collect_layers(
        &self,
        descriptor: &ComponentDescriptor,
    ) -> Result<Vec<LayerRef>, Error> {
        let repo = self.repo_path(descriptor.name());
        let mut layers = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let accesses = descriptor
            .component
            .resources
            .iter()
            .filter_map(|r| r.access.as_ref())
            .chain(
                descriptor
                    .component
                    .sources
                    .iter()
                    .filter_map(|s| s.access.as_ref()),
            );
        for access in accesses {
            if let AccessSpec::LocalBlob {
                media_type,
                local_reference,
            } = access
            {
                if !seen.insert(local_reference.clone()) {
                    continue;
                }
                match self.layer_for(local_reference) {
                    Ok(layer) => layers.push(layer),
                    Err(Error::LocalBlobNotFound { .. }) => {
                        // not staged by this handle; the registry may have it
                        let digest = local_reference
                            .parse()
                            .map_err(|_| Error::BadDigest(local_reference.clone()))?;
                        let size = self
                            .client
                            .head_blob(&self.registry, &repo, &digest)
                            .await?
                            .ok_or_else(|| Error::LocalBlobNotFound {
                                reference: local_reference.clone(),
                            })?;
                        layers.push(LayerRef {
                            digest,
                            size,
                            media_type: media_type.clone(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(layers)
    }

    /// Index entries for resources whose access is an OCI image in this same
    /// registry, pinned by digest. Anything unreachable is skipped with a
    /// warning rather than failing the commit.
    async fn linked_manifests(
        &self,
        descriptor: &ComponentDescriptor,
    ) -> Result<Vec<Descriptor>, Error> {
        let mut linked = Vec::new();
        for resource in &descriptor.component.resources {
            let Some(AccessSpec::OciImage { image_reference }) = &resource.access else {
                continue;
            };
            let Some(image) = parse_image_reference(image_reference) else {
                warn!("unparseable image reference {image_reference}, not linking");
                continue;
            };
            if image.authority != self.registry.authority {
                trace!("image {image_reference} lives elsewhere, not linking");
                continue;
            }
            let Some(reference) = image.digest.as_deref().or(image.tag.as_deref()) else {
                continue;
            };
            match self
                .fetch_manifest_cached(&image.repo, reference, ACCEPTED_IMAGE_MANIFEST)
                .await
            {
                Ok(Some(cached)) => {
                    linked.push(
                        DescriptorBuilder::default()
                            .media_type(MediaType::Other(cached.media_type.clone()))
                            .digest(
                                cached
                                    .digest
                                    .parse::<oci_spec::image::Digest>()
                                    .map_err(|_| Error::BadDigest(cached.digest.clone()))?,
                            )
                            .size(cached.data.len() as u64)
                            .build()?,
                    );
                }
                Ok(None) => warn!("linked image {image_reference} not found, skipping"),
                Err(e) => warn!("linked image {image_reference} unreadable ({e:?}), skipping"),
            }
        }
        Ok(linked)
    }

    fn registry_for(&self, authority: &str) -> Registry {
        if authority == self.registry.authority {
            self.registry.clone()
        } else {
            Registry {
                scheme: "https".to_string(),
                authority: authority.to_string(),
            }
        }
    }
}

#[async_trait]
impl ComponentVersionRepository for OciRepository {
    async fn add_component_version(&self, descriptor: &ComponentDescriptor) -> Result<(), Error> {
        descriptor.validate()?;
        let name = descriptor.name();
        let version = descriptor.version();
        let repo = self.repo_path(name);

        let layers = self.collect_layers(descriptor).await?;
        let linked = self.linked_manifests(descriptor).await?;
        let built = layout::build(descriptor, &layers, &linked)?;

        for blob in &built.blobs {
            self.client
                .push_blob(&self.registry, &repo, &blob.digest, blob.data.clone())
                .await
                .map_err(|e| Error::op("add_component_version", name, version)(e.into()))?;
        }
        self.client
            .put_manifest(
                &self.registry,
                &repo,
                &built.manifest_digest.to_string(),
                OCI_IMAGE_MANIFEST_V1,
                built.manifest_data.clone(),
            )
            .await
            .map_err(|e| Error::op("add_component_version", name, version)(e.into()))?;
        self.client
            .put_manifest(
                &self.registry,
                &repo,
                version,
                OCI_IMAGE_INDEX_V1,
                built.index_data.clone(),
            )
            .await
            .map_err(|e| Error::op("add_component_version", name, version)(e.into()))?;

        // overwrite produces a new manifest under the same tag; drop the old one
        let tag_key = manifest_key(&self.registry.authority, &repo, version);
        self.manifest_cache.invalidate(&tag_key).await;
        self.descriptor_cache.invalidate(&tag_key);
        Ok(())
    }

    async fn get_component_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ComponentDescriptor, Error> {
        let (descriptor, _) = self.load_descriptor(name, version).await?;
        Ok(descriptor)
    }

    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>, Error> {
        let repo = self.repo_path(name);
        Ok(self.client.list_tags(&self.registry, &repo).await?)
    }

    async fn add_local_resource(
        &self,
        name: &str,
        version: &str,
        resource: &Resource,
        blob: &dyn Blob,
    ) -> Result<Resource, Error> {
        let repo = self.repo_path(name);
        let (digest, data) = buffer_and_digest(blob, resource.digest.as_ref())
            .map_err(Error::op("add_local_resource", name, version))?;
        let oci_digest = digest
            .to_string()
            .parse()
            .map_err(|_| Error::BadDigest(digest.to_string()))?;
        let media_type = blob
            .media_type()
            .unwrap_or_else(|| ocmblob::DEFAULT_MEDIA_TYPE.to_string());
        self.client
            .push_blob(&self.registry, &repo, &oci_digest, data.clone())
            .await
            .map_err(|e| Error::op("add_local_resource", name, version)(e.into()))?;
        self.layer_cache.insert(digest.to_string(), data.clone()).await;
        self.staged.lock().unwrap().insert(
            digest.to_string(),
            StagedBlob {
                size: data.len() as u64,
                media_type: media_type.clone(),
            },
        );
        let mut updated = resource.clone();
        updated.access = Some(AccessSpec::local_blob(media_type, digest.to_string()));
        updated.digest = Some(digest);
        Ok(updated)
    }

    async fn get_local_resource(
        &self,
        name: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Box<dyn Blob>, Resource), Error> {
        let (descriptor, manifest) = self.load_descriptor(name, version).await?;
        let resource = descriptor
            .find_resource(identity)
            .ok_or_else(|| Error::ResourceNotFound {
                identity: identity.to_string(),
            })?;
        let blob = self
            .local_blob_for(name, resource.access.as_ref(), &manifest, identity)
            .await?;
        Ok((blob, resource.clone()))
    }

    async fn add_local_source(
        &self,
        name: &str,
        version: &str,
        source: &Source,
        blob: &dyn Blob,
    ) -> Result<Source, Error> {
        let repo = self.repo_path(name);
        let (digest, data) = buffer_and_digest(blob, source.digest.as_ref())
            .map_err(Error::op("add_local_source", name, version))?;
        let oci_digest = digest
            .to_string()
            .parse()
            .map_err(|_| Error::BadDigest(digest.to_string()))?;
        let media_type = blob
            .media_type()
            .unwrap_or_else(|| ocmblob::DEFAULT_MEDIA_TYPE.to_string());
        self.client
            .push_blob(&self.registry, &repo, &oci_digest, data.clone())
            .await
            .map_err(|e| Error::op("add_local_source", name, version)(e.into()))?;
        self.staged.lock().unwrap().insert(
            digest.to_string(),
            StagedBlob {
                size: data.len() as u64,
                media_type: media_type.clone(),
            },
        );
        let mut updated = source.clone();
        updated.access = Some(AccessSpec::local_blob(media_type, digest.to_string()));
        updated.digest = Some(digest);
        Ok(updated)
    }

    async fn get_local_source(
        &self,
        name: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Box<dyn Blob>, Source), Error> {
        let (descriptor, manifest) = self.load_descriptor(name, version).await?;
        let source = descriptor
            .find_source(identity)
            .ok_or_else(|| Error::SourceNotFound {
                identity: identity.to_string(),
            })?;
        let blob = self
            .local_blob_for(name, source.access.as_ref(), &manifest, identity)
            .await?;
        Ok((blob, source.clone()))
    }
}

impl OciRepository {
    async fn local_blob_for(
        &self,
        name: &str,
        access: Option<&AccessSpec>,
        manifest: &ImageManifest,
        identity: &Identity,
    ) -> Result<Box<dyn Blob>, Error> {
        let Some(AccessSpec::LocalBlob {
            media_type,
            local_reference,
        }) = access
        else {
            return Err(Error::InvalidAccess(format!(
                "resource {} is not a local blob",
                identity
            )));
        };
        let repo = self.repo_path(name);
        let (size, _) = layout::layer_info(manifest, local_reference).ok_or_else(|| {
            Error::LocalBlobNotFound {
                reference: local_reference.clone(),
            }
        })?;
        let oci_digest = local_reference
            .parse::<oci_spec::image::Digest>()
            .map_err(|_| Error::BadDigest(local_reference.clone()))?;
        let layer_descriptor = Descriptor::new(
            MediaType::Other(media_type.clone()),
            size,
            oci_digest,
        );
        let data = self.fetch_layer_cached(&repo, &layer_descriptor).await?;
        let blob = MemoryBlob::from_bytes(data.to_vec());
        blob.set_media_type(media_type);
        let digest: Digest = local_reference
            .parse()
            .map_err(|_| Error::BadDigest(local_reference.clone()))?;
        blob.set_precalculated_digest(digest);
        Ok(Box::new(blob))
    }
}

#[async_trait]
impl ResourceRepository for OciRepository {
    /// Push the blob as a single-layer artifact image at the resource's
    /// image reference and pin the reference to the resulting manifest
    /// digest.
    async fn upload_resource(
        &self,
        resource: &Resource,
        blob: &dyn Blob,
    ) -> Result<Resource, Error> {
        let Some(AccessSpec::OciImage { image_reference }) = &resource.access else {
            return Err(Error::InvalidAccess(
                "upload_resource needs an OCI image access".to_string(),
            ));
        };
        let image = parse_image_reference(image_reference)
            .ok_or_else(|| Error::InvalidAccess(format!("bad image reference {image_reference}")))?;
        let registry = self.registry_for(&image.authority);

        let (digest, data) = buffer_and_digest(blob, resource.digest.as_ref())?;
        let media_type = blob
            .media_type()
            .unwrap_or_else(|| ocmblob::DEFAULT_MEDIA_TYPE.to_string());
        let layer_oci_digest: oci_spec::image::Digest = digest
            .to_string()
            .parse()
            .map_err(|_| Error::BadDigest(digest.to_string()))?;

        // config and layer blobs first, then the manifest referencing them
        let config_data = Bytes::from_static(b"{}");
        let config_digest = layout::oci_digest(&config_data);
        self.client
            .push_blob(&registry, &image.repo, &config_digest, config_data.clone())
            .await?;
        self.client
            .push_blob(&registry, &image.repo, &layer_oci_digest, data.clone())
            .await?;

        let manifest = oci_spec::image::ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(
                DescriptorBuilder::default()
                    .media_type(MediaType::Other(
                        "application/vnd.oci.empty.v1+json".to_string(),
                    ))
                    .digest(config_digest)
                    .size(config_data.len() as u64)
                    .build()?,
            )
            .layers(vec![
                DescriptorBuilder::default()
                    .media_type(MediaType::Other(media_type))
                    .digest(layer_oci_digest)
                    .size(data.len() as u64)
                    .build()?,
            ])
            .build()?;
        let manifest_data = Bytes::from(serde_json::to_vec(&manifest)?);
        let tag = image.tag.as_deref().unwrap_or("latest");
        let manifest_digest = self
            .client
            .put_manifest(
                &registry,
                &image.repo,
                tag,
                OCI_IMAGE_MANIFEST_V1,
                manifest_data,
            )
            .await?;

        let mut updated = resource.clone();
        updated.access = Some(AccessSpec::oci_image(format!(
            "{}/{}:{}@{}",
            image.authority, image.repo, tag, manifest_digest
        )));
        updated.digest = Some(digest);
        Ok(updated)
    }

    async fn download_resource(&self, resource: &Resource) -> Result<Box<dyn Blob>, Error> {
        let Some(AccessSpec::OciImage { image_reference }) = &resource.access else {
            return Err(Error::InvalidAccess(
                "download_resource needs an OCI image access".to_string(),
            ));
        };
        let image = parse_image_reference(image_reference)
            .ok_or_else(|| Error::InvalidAccess(format!("bad image reference {image_reference}")))?;
        let registry = self.registry_for(&image.authority);
        let reference = image
            .digest
            .as_deref()
            .or(image.tag.as_deref())
            .unwrap_or("latest");

        let (_, manifest) = self
            .client
            .get_image_manifest(&registry, &image.repo, reference)
            .await?
            .ok_or_else(|| Error::LocalBlobNotFound {
                reference: image_reference.clone(),
            })?;
        let layer = manifest
            .layers()
            .first()
            .ok_or_else(|| Error::CorruptLayout("image without layers".to_string()))?;
        let data = self
            .client
            .get_blob_bytes(&registry, &image.repo, layer)
            .await?
            .ok_or_else(|| Error::LocalBlobNotFound {
                reference: layer.digest().to_string(),
            })?;
        let blob = MemoryBlob::from_bytes(data.to_vec());
        blob.set_media_type(&layer.media_type().to_string());
        Ok(Box::new(blob))
    }
}

fn buffer_and_digest(
    blob: &dyn Blob,
    declared: Option<&Digest>,
) -> Result<(Digest, Bytes), Error> {
    let mut data = Vec::new();
    ocmblob::copy(&mut data, blob)?;
    let digest = Digest::sha256_of(&data);
    if let Some(expected) = declared {
        let got = match expected.algorithm() {
            Algorithm::Sha256 => digest.clone(),
            Algorithm::Sha512 => Digest::sha512_of(&data),
        };
        if expected != &got {
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                got,
            });
        }
    }
    Ok((digest, data.into()))
}

#[derive(Debug, PartialEq)]
struct ImageRef {
    authority: String,
    repo: String,
    tag: Option<String>,
    digest: Option<String>,
}

// host[:port]/repo[:tag][@algo:hex]
fn parse_image_reference(input: &str) -> Option<ImageRef> {
    let (rest, digest) = match input.split_once('@') {
        Some((r, d)) => (r, Some(d.to_string())),
        None => (input, None),
    };
    let (authority, path) = rest.split_once('/')?;
    if authority.is_empty() || path.is_empty() {
        return None;
    }
    let (repo, tag) = match path.rsplit_once(':') {
        Some((r, t)) if !t.contains('/') => (r.to_string(), Some(t.to_string())),
        _ => (path.to_string(), None),
    };
    Some(ImageRef {
        authority: authority.to_string(),
        repo,
        tag,
        digest,
    })
}
