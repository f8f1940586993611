//! Controller-side core: a runtime-reconfigurable informer manager over a
//! metadata-only watch API, the context/session cache keyed by configuration
//! hashes, and the component downgrade policy.

pub mod context_cache;
pub mod downgrade;
pub mod informer;
pub mod meta;
pub mod metrics;
pub mod queue;
pub mod status;

pub use context_cache::{
    Closeable, ContextCache, OcmContextCache, hash_config_set, hash_repo_spec,
};
pub use downgrade::{DowngradePolicy, check_downgrade};
pub use informer::{InformerManager, ManagerOptions, WatchClient};
pub use meta::{PartialObjectMeta, WatchEvent};
pub use queue::{DedupQueue, ReconcileRequest, WorkQueue};
