pub mod access;
pub mod descriptor;
pub mod digest;
pub mod identity;
pub mod reference;
pub mod repospec;
pub mod scheme;
pub mod typed;

pub use access::AccessSpec;
pub use descriptor::{Component, ComponentDescriptor, Resource, Source};
pub use digest::{Algorithm, Digest, Hasher};
pub use identity::Identity;
pub use repospec::{AccessMode, RepositorySpec};
pub use typed::TypeName;
