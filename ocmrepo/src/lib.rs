//! Component-version repositories: the backend contract, the OCI and CTF
//! implementations, the caching repository provider, and the fallback
//! resolver layering several repositories behind one read interface.

pub mod caches;
pub mod credentials;
pub mod ctf;
pub mod descriptor_cache;
pub mod fallback;
pub mod layout;
pub mod oci;
pub mod ocidist;
pub mod provider;
pub mod repository;

pub use credentials::{CredentialCache, CredentialResolver, Credentials};
pub use fallback::{FallbackEntry, FallbackRepository};
pub use provider::RepositoryProvider;
pub use repository::{ComponentVersionRepository, Error, ResourceRepository};

/// Media type of the serialized component descriptor layer.
pub const MT_COMPONENT_DESCRIPTOR: &str =
    "application/vnd.ocm.software.component-descriptor.v2+json";
/// Media type of the component config blob referenced by the manifest.
pub const MT_COMPONENT_CONFIG: &str = "application/vnd.ocm.software.component.config.v1+json";
/// Well-known repository path segment below which descriptors live.
pub const DESCRIPTOR_PATH_PREFIX: &str = "component-descriptors";
