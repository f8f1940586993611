//! Common Transport Format: an OCI distribution filesystem layout
//! (`oci-layout`, `index.json`, `blobs/<algo>/<hex>`) stored as a plain
//! directory or a tar / tar.gz archive. Component descriptors live as blobs
//! referenced by per-version indexes tagged through the ref.name annotation.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{error, info, trace};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType,
};

use ocmblob::{
    Blob, DigestAware, DigestPrecalculatable, MediaTypeAware, MediaTypeOverrideable, MemoryBlob,
};
use ocmmodel::access::AccessSpec;
use ocmmodel::descriptor::{ComponentDescriptor, Resource, Source};
use ocmmodel::digest::{Algorithm, Digest};
use ocmmodel::identity::Identity;
use ocmmodel::repospec::AccessMode;

use crate::layout::{self, LayerRef, REF_NAME_ANNOTATION};
use crate::repository::{ComponentVersionRepository, Error};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Backing {
    Directory,
    Tar { gz: bool },
}

fn backing_for(path: &Path) -> Backing {
    let name = path.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Backing::Tar { gz: true }
    } else if name.ends_with(".tar") {
        Backing::Tar { gz: false }
    } else {
        Backing::Directory
    }
}

struct State {
    // the manifest entries of index.json; rebuilt into an ImageIndex on flush
    entries: Vec<Descriptor>,
    // archive backing keeps blob bytes in memory until flushed
    tar_blobs: HashMap<String, Vec<u8>>,
}

/// One store per on-disk path; the repository provider guarantees that two
/// handles for the same path share this object, making the inner mutex the
/// only serialization the archive needs.
pub struct CtfStore {
    path: PathBuf,
    mode: AccessMode,
    backing: Backing,
    state: Mutex<State>,
}

impl CtfStore {
    pub fn open(path: impl Into<PathBuf>, mode: AccessMode) -> Result<CtfStore, Error> {
        let path = path.into();
        let backing = backing_for(&path);
        let exists = path.exists();
        if !exists && !mode.contains(AccessMode::CREATE) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("ctf archive {} does not exist", path.display()),
            )));
        }

        let state = if exists {
            match backing {
                Backing::Directory => {
                    let index = read_index(&path.join(INDEX_FILE))?;
                    State {
                        entries: index.manifests().clone(),
                        tar_blobs: HashMap::new(),
                    }
                }
                Backing::Tar { gz } => load_tar(&path, gz)?,
            }
        } else {
            info!("creating ctf archive at {}", path.display());
            State {
                entries: Vec::new(),
                tar_blobs: HashMap::new(),
            }
        };

        let store = CtfStore {
            path,
            mode,
            backing,
            state: Mutex::new(state),
        };
        if !exists {
            store.init()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<(), Error> {
        match self.backing {
            Backing::Directory => {
                fs::create_dir_all(self.path.join("blobs"))?;
                fs::write(self.path.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;
                self.flush(&self.state.lock().unwrap())
            }
            Backing::Tar { .. } => self.flush(&self.state.lock().unwrap()),
        }
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.mode.writable() {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    pub fn write_blob(&self, digest: &str, data: &[u8]) -> Result<(), Error> {
        self.check_writable()?;
        trace!("ctf write blob {} ({} bytes)", digest, data.len());
        match self.backing {
            Backing::Directory => {
                let rel = digest.replacen(':', "/", 1);
                let target = self.path.join("blobs").join(rel);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                write_atomic(&target, data)
            }
            Backing::Tar { .. } => {
                let mut state = self.state.lock().unwrap();
                state.tar_blobs.insert(digest.to_string(), data.to_vec());
                self.flush(&state)
            }
        }
    }

    pub fn read_blob(&self, digest: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.backing {
            Backing::Directory => {
                let rel = digest.replacen(':', "/", 1);
                match fs::read(self.path.join("blobs").join(rel)) {
                    Ok(data) => Ok(Some(data)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Backing::Tar { .. } => Ok(self.state.lock().unwrap().tar_blobs.get(digest).cloned()),
        }
    }

    pub fn blob_size(&self, digest: &str) -> Result<Option<u64>, Error> {
        match self.backing {
            Backing::Directory => {
                let rel = digest.replacen(':', "/", 1);
                match fs::metadata(self.path.join("blobs").join(rel)) {
                    Ok(m) => Ok(Some(m.len())),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Backing::Tar { .. } => Ok(self
                .state
                .lock()
                .unwrap()
                .tar_blobs
                .get(digest)
                .map(|b| b.len() as u64)),
        }
    }

    /// Install (or replace) the index entry carrying this ref name. This is
    /// what "rewriting the archive entry" on overwrite amounts to.
    pub fn set_ref(&self, ref_name: &str, descriptor: Descriptor) -> Result<(), Error> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|d| {
            d.annotations()
                .as_ref()
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .map(String::as_str)
                != Some(ref_name)
        });
        state.entries.push(descriptor);
        self.flush(&state)
    }

    pub fn get_ref(&self, ref_name: &str) -> Result<Option<Descriptor>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .find(|d| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map(String::as_str)
                    == Some(ref_name)
            })
            .cloned())
    }

    pub fn list_refs(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter_map(|d| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
            })
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn build_index(entries: &[Descriptor]) -> Result<ImageIndex, Error> {
        Ok(ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(entries.to_vec())
            .build()?)
    }

    fn flush(&self, state: &State) -> Result<(), Error> {
        let index = Self::build_index(&state.entries)?;
        let index_json = serde_json::to_vec(&index)?;
        match self.backing {
            Backing::Directory => write_atomic(&self.path.join(INDEX_FILE), &index_json),
            Backing::Tar { gz } => {
                let tmp = self.path.with_extension("tmp");
                {
                    let file = File::create(&tmp)?;
                    if gz {
                        let enc =
                            flate2::write::GzEncoder::new(file, flate2::Compression::default());
                        write_tar(enc, &index_json, &state.tar_blobs)?;
                    } else {
                        write_tar(file, &index_json, &state.tar_blobs)?;
                    }
                }
                fs::rename(&tmp, &self.path)?;
                Ok(())
            }
        }
    }
}

fn read_index(path: &Path) -> Result<ImageIndex, Error> {
    let data = fs::read(path)?;
    Ok(ImageIndex::from_reader(std::io::Cursor::new(data))?)
}

fn load_tar(path: &Path, gz: bool) -> Result<State, Error> {
    let file = File::open(path)?;
    if gz {
        read_tar_entries(flate2::read::GzDecoder::new(file))
    } else {
        read_tar_entries(file)
    }
}

fn read_tar_entries(reader: impl Read) -> Result<State, Error> {
    let mut archive = tar::Archive::new(reader);
    let mut index_json: Option<Vec<u8>> = None;
    let mut tar_blobs = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        let name = path.to_string_lossy().to_string();
        if name == INDEX_FILE {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            index_json = Some(data);
        } else if let Some(rest) = name.strip_prefix("blobs/") {
            let digest = rest.replacen('/', ":", 1);
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            tar_blobs.insert(digest, data);
        }
        // oci-layout is rewritten on flush, nothing to keep
    }
    let entries = match index_json {
        Some(data) => ImageIndex::from_reader(std::io::Cursor::new(data))?
            .manifests()
            .clone(),
        None => return Err(Error::CorruptLayout("archive without index.json".to_string())),
    };
    Ok(State { entries, tar_blobs })
}

fn write_tar<W: Write>(
    writer: W,
    index_json: &[u8],
    blobs: &HashMap<String, Vec<u8>>,
) -> Result<(), Error> {
    let mut builder = tar::Builder::new(writer);
    append_file(&mut builder, OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT.as_bytes())?;
    append_file(&mut builder, INDEX_FILE, index_json)?;
    // stable entry order so the same content produces the same archive
    let mut digests: Vec<_> = blobs.keys().collect();
    digests.sort();
    for digest in digests {
        let rel = format!("blobs/{}", digest.replacen(':', "/", 1));
        append_file(&mut builder, &rel, &blobs[digest])?;
    }
    builder.into_inner()?.flush()?;
    Ok(())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

// write to a _tmp sibling and rename into place, cleaning up on failure
fn write_atomic(target: &Path, data: &[u8]) -> Result<(), Error> {
    let tmp = target.with_file_name(format!(
        "{}_tmp",
        target.file_name().unwrap_or_default().to_string_lossy()
    ));
    fs::write(&tmp, data)?;
    match fs::rename(&tmp, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(unlink) = fs::remove_file(&tmp) {
                error!("leaving tmp file behind after failed rename: {:?}", unlink);
            }
            Err(e.into())
        }
    }
}

/// Component-version repository over a shared [CtfStore].
pub struct CtfRepository {
    store: Arc<CtfStore>,
}

impl CtfRepository {
    pub fn new(store: Arc<CtfStore>) -> CtfRepository {
        CtfRepository { store }
    }

    fn store_blob(&self, blob: &dyn Blob, declared: Option<&Digest>) -> Result<(Digest, u64), Error> {
        let mut data = Vec::new();
        ocmblob::copy(&mut data, blob)?;
        let digest = Digest::sha256_of(&data);
        if let Some(expected) = declared {
            // compare in the algorithm the caller declared
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
        let size = data.len() as u64;
        self.store.write_blob(&digest.to_string(), &data)?;
        Ok((digest, size))
    }

    fn load_descriptor(&self, name: &str, version: &str) -> Result<ComponentDescriptor, Error> {
        let ref_name = layout::ref_name(name, version);
        let entry = self
            .store
            .get_ref(&ref_name)?
            .ok_or_else(|| Error::ComponentVersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })?;
        let index_data = self
            .store
            .read_blob(&entry.digest().to_string())?
            .ok_or_else(|| Error::CorruptLayout(format!("missing index blob {}", entry.digest())))?;
        let index = ImageIndex::from_reader(std::io::Cursor::new(index_data))?;
        let manifest_entry = layout::find_component_manifest(&index)?;
        let manifest_data = self
            .store
            .read_blob(&manifest_entry.digest().to_string())?
            .ok_or_else(|| {
                Error::CorruptLayout(format!("missing manifest blob {}", manifest_entry.digest()))
            })?;
        let manifest = ImageManifest::from_reader(std::io::Cursor::new(manifest_data))?;
        let layer = layout::find_descriptor_layer(&manifest)?;
        let data = self
            .store
            .read_blob(&layer.digest().to_string())?
            .ok_or_else(|| {
                Error::CorruptLayout(format!("missing descriptor blob {}", layer.digest()))
            })?;
        layout::parse_descriptor(&data)
    }

    fn local_blob(&self, access: &AccessSpec, identity: &Identity) -> Result<Box<dyn Blob>, Error> {
        let AccessSpec::LocalBlob {
            media_type,
            local_reference,
        } = access
        else {
            return Err(Error::InvalidAccess(format!(
                "resource {} is not a local blob",
                identity
            )));
        };
        let digest: Digest = local_reference
            .parse()
            .map_err(|_| Error::BadDigest(local_reference.clone()))?;
        let data = self
            .store
            .read_blob(local_reference)?
            .ok_or_else(|| Error::LocalBlobNotFound {
                reference: local_reference.clone(),
            })?;
        let got = Digest::sha256_of(&data);
        if got != digest && digest.algorithm() == got.algorithm() {
            return Err(Error::DigestMismatch {
                expected: digest,
                got,
            });
        }
        let blob = MemoryBlob::from_bytes(data);
        blob.set_media_type(media_type);
        blob.set_precalculated_digest(digest);
        Ok(Box::new(blob))
    }

    fn collect_layers(&self, descriptor: &ComponentDescriptor) -> Result<Vec<LayerRef>, Error> {
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
                let size = self.store.blob_size(local_reference)?.ok_or_else(|| {
                    Error::LocalBlobNotFound {
                        reference: local_reference.clone(),
                    }
                })?;
                layers.push(LayerRef {
                    digest: local_reference
                        .parse()
                        .map_err(|_| Error::BadDigest(local_reference.clone()))?,
                    size,
                    media_type: media_type.clone(),
                });
            }
        }
        Ok(layers)
    }
}

#[async_trait]
impl ComponentVersionRepository for CtfRepository {
    async fn add_component_version(&self, descriptor: &ComponentDescriptor) -> Result<(), Error> {
        descriptor.validate()?;
        let layers = self.collect_layers(descriptor)?;
        let built = layout::build(descriptor, &layers, &[])?;
        for blob in &built.blobs {
            self.store.write_blob(&blob.digest.to_string(), &blob.data)?;
        }
        self.store
            .write_blob(&built.manifest_digest.to_string(), &built.manifest_data)?;
        let index_digest = layout::oci_digest(&built.index_data);
        self.store
            .write_blob(&index_digest.to_string(), &built.index_data)?;

        let annotations = HashMap::from([(
            REF_NAME_ANNOTATION.to_string(),
            layout::ref_name(descriptor.name(), descriptor.version()),
        )]);
        let entry = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(index_digest)
            .size(built.index_data.len() as u64)
            .annotations(annotations)
            .build()?;
        self.store
            .set_ref(&layout::ref_name(descriptor.name(), descriptor.version()), entry)
            .map_err(Error::op(
                "add_component_version",
                descriptor.name(),
                descriptor.version(),
            ))
    }

    async fn get_component_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ComponentDescriptor, Error> {
        self.load_descriptor(name, version)
    }

    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>, Error> {
        let prefix = format!("{}/{}:", crate::DESCRIPTOR_PATH_PREFIX, name);
        Ok(self
            .store
            .list_refs(&prefix)?
            .into_iter()
            .filter_map(|r| r.rsplit_once(':').map(|(_, v)| v.to_string()))
            .collect())
    }

    async fn add_local_resource(
        &self,
        name: &str,
        version: &str,
        resource: &Resource,
        blob: &dyn Blob,
    ) -> Result<Resource, Error> {
        let (digest, _size) = self
            .store_blob(blob, resource.digest.as_ref())
            .map_err(Error::op("add_local_resource", name, version))?;
        let media_type = blob
            .media_type()
            .unwrap_or_else(|| ocmblob::DEFAULT_MEDIA_TYPE.to_string());
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
        let descriptor = self.load_descriptor(name, version)?;
        let resource = descriptor
            .find_resource(identity)
            .ok_or_else(|| Error::ResourceNotFound {
                identity: identity.to_string(),
            })?;
        let access = resource.access.as_ref().ok_or_else(|| {
            Error::InvalidAccess(format!("resource {} has no access", identity))
        })?;
        let blob = self.local_blob(access, identity)?;
        Ok((blob, resource.clone()))
    }

    async fn add_local_source(
        &self,
        name: &str,
        version: &str,
        source: &Source,
        blob: &dyn Blob,
    ) -> Result<Source, Error> {
        let (digest, _size) = self
            .store_blob(blob, source.digest.as_ref())
            .map_err(Error::op("add_local_source", name, version))?;
        let media_type = blob
            .media_type()
            .unwrap_or_else(|| ocmblob::DEFAULT_MEDIA_TYPE.to_string());
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
        let descriptor = self.load_descriptor(name, version)?;
        let source = descriptor
            .find_source(identity)
            .ok_or_else(|| Error::SourceNotFound {
                identity: identity.to_string(),
            })?;
        let access = source.access.as_ref().ok_or_else(|| {
            Error::InvalidAccess(format!("source {} has no access", identity))
        })?;
        let blob = self.local_blob(access, identity)?;
        Ok((blob, source.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmblob::ReadOnlyBlob;
    use ocmmodel::descriptor::Relation;

    fn resource(name: &str) -> Resource {
        Resource {
            name: name.to_string(),
            version: "v1.0.0".to_string(),
            typ: "blob".to_string(),
            relation: Relation::Local,
            access: None,
            digest: None,
            creation_time: None,
            labels: Vec::new(),
        }
    }

    fn repo_at(path: &Path) -> CtfRepository {
        let store = CtfStore::open(
            path,
            AccessMode::RDWR | AccessMode::CREATE,
        )
        .unwrap();
        CtfRepository::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_component_version_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_at(&dir.path().join("ctf"));
        let descriptor = ComponentDescriptor::new("test-component", "v1.0.0", "ocm.software/test");
        repo.add_component_version(&descriptor).await.unwrap();

        let got = repo
            .get_component_version("test-component", "v1.0.0")
            .await
            .unwrap();
        assert_eq!(got, descriptor);

        let versions = repo.list_component_versions("test-component").await.unwrap();
        assert_eq!(versions, vec!["v1.0.0".to_string()]);

        assert!(
            repo.get_component_version("test-component", "v9.9.9")
                .await
                .unwrap_err()
                .not_found()
        );
        assert!(
            repo.list_component_versions("other")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_local_resource_digest() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_at(&dir.path().join("ctf"));

        let blob = MemoryBlob::from_bytes("foobar");
        let updated = repo
            .add_local_resource("test-component", "v1.0.0", &resource("data"), &blob)
            .await
            .unwrap();
        assert_eq!(
            updated.digest.as_ref().unwrap().to_string(),
            "sha256:c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2"
        );
        match updated.access.as_ref().unwrap() {
            AccessSpec::LocalBlob {
                local_reference, ..
            } => assert_eq!(local_reference, &updated.digest.as_ref().unwrap().to_string()),
            other => panic!("unexpected access {other:?}"),
        }

        let mut descriptor =
            ComponentDescriptor::new("test-component", "v1.0.0", "ocm.software/test");
        descriptor.component.resources.push(updated);
        repo.add_component_version(&descriptor).await.unwrap();

        let identity = Identity::new().with("name", "data");
        let (blob, res) = repo
            .get_local_resource("test-component", "v1.0.0", &identity)
            .await
            .unwrap();
        assert_eq!(res.name, "data");
        let mut content = Vec::new();
        blob.open_reader().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"foobar");
        assert_eq!(blob.digest(), res.digest);
    }

    #[tokio::test]
    async fn test_declared_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_at(&dir.path().join("ctf"));
        let mut res = resource("data");
        res.digest = Some(Digest::sha256_of("something else"));
        let err = repo
            .add_local_resource("c", "v1", &res, &MemoryBlob::from_bytes("foobar"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("digest verification failed"));
    }

    #[tokio::test]
    async fn test_tar_backing_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.tar.gz");
        {
            let repo = repo_at(&path);
            let descriptor = ComponentDescriptor::new("c", "v1.0.0", "p");
            repo.add_component_version(&descriptor).await.unwrap();
        }
        // reopen from disk
        let store = CtfStore::open(&path, AccessMode::RDONLY).unwrap();
        let repo = CtfRepository::new(Arc::new(store));
        let got = repo.get_component_version("c", "v1.0.0").await.unwrap();
        assert_eq!(got.name(), "c");
        // readonly rejects writes
        let err = repo
            .add_component_version(&ComponentDescriptor::new("d", "v1", "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly | Error::Op { .. }));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_at(&dir.path().join("ctf"));
        let mut descriptor = ComponentDescriptor::new("c", "v1.0.0", "p");
        repo.add_component_version(&descriptor).await.unwrap();
        descriptor.component.provider = "q".to_string();
        repo.add_component_version(&descriptor).await.unwrap();
        let got = repo.get_component_version("c", "v1.0.0").await.unwrap();
        assert_eq!(got.component.provider, "q");
        assert_eq!(
            repo.list_component_versions("c").await.unwrap().len(),
            1,
            "overwrite must not duplicate the index entry"
        );
    }
}
