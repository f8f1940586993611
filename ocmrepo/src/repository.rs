use async_trait::async_trait;

use ocmblob::Blob;
use ocmmodel::descriptor::{ComponentDescriptor, Resource, Source};
use ocmmodel::digest::Digest;
use ocmmodel::identity::Identity;

use crate::ocidist;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    ComponentVersionNotFound { name: String, version: String },
    ResourceNotFound { identity: String },
    SourceNotFound { identity: String },
    LocalBlobNotFound { reference: String },
    InvalidDescriptor(#[from] ocmmodel::descriptor::Error),
    InvalidAccess(String),
    DigestMismatch { expected: Digest, got: Digest },
    SizeMismatch { expected: u64, got: u64 },
    BadDigest(String),
    ReadOnly,
    Blob(#[from] ocmblob::Error),
    Client(#[from] ocidist::Error),
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    CorruptLayout(String),
    // a backend error annotated with the operation and the component it hit
    Op {
        op: &'static str,
        component: String,
        version: String,
        source: Box<Error>,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Op {
                op,
                component,
                version,
                source,
            } => write!(f, "{op} {component}:{version}: {source}"),
            Error::DigestMismatch { expected, got } => {
                write!(f, "digest verification failed: expected {expected}, got {got}")
            }
            other => write!(f, "{:?}", other),
        }
    }
}

impl Error {
    pub fn not_found(&self) -> bool {
        match self {
            Error::ComponentVersionNotFound { .. }
            | Error::ResourceNotFound { .. }
            | Error::SourceNotFound { .. }
            | Error::LocalBlobNotFound { .. } => true,
            Error::Op { source, .. } => source.not_found(),
            _ => false,
        }
    }

    pub(crate) fn op(
        op: &'static str,
        component: &str,
        version: &str,
    ) -> impl FnOnce(Error) -> Error {
        let component = component.to_string();
        let version = version.to_string();
        move |source| Error::Op {
            op,
            component,
            version,
            source: Box::new(source),
        }
    }
}

/// Storage and retrieval of component descriptors and their local blobs.
/// The invariant every backend upholds: after `add_component_version`, the
/// digests embedded in the returned descriptor match the bytes obtainable
/// via `get_local_resource`.
#[async_trait]
pub trait ComponentVersionRepository: Send + Sync {
    async fn add_component_version(&self, descriptor: &ComponentDescriptor) -> Result<(), Error>;

    /// The most recently committed descriptor with that identity.
    async fn get_component_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ComponentDescriptor, Error>;

    /// All known versions of a component, order unspecified. An unknown
    /// component is an empty list, not an error.
    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>, Error>;

    /// Persist the blob and return the resource with its access rewritten to
    /// a local-blob reference (the digest) and its digest populated.
    async fn add_local_resource(
        &self,
        name: &str,
        version: &str,
        resource: &Resource,
        blob: &dyn Blob,
    ) -> Result<Resource, Error>;

    async fn get_local_resource(
        &self,
        name: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Box<dyn Blob>, Resource), Error>;

    async fn add_local_source(
        &self,
        name: &str,
        version: &str,
        source: &Source,
        blob: &dyn Blob,
    ) -> Result<Source, Error>;

    async fn get_local_source(
        &self,
        name: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Box<dyn Blob>, Source), Error>;
}

/// Upload/download of resources living outside the component repository,
/// addressed by their (external) access specification.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Upload the blob to wherever the access specification points and
    /// return the resource with its backend-specific global access.
    async fn upload_resource(&self, resource: &Resource, blob: &dyn Blob)
    -> Result<Resource, Error>;

    async fn download_resource(&self, resource: &Resource) -> Result<Box<dyn Blob>, Error>;
}
