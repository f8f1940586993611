//! Declarative construction of component versions: a constructor spec in,
//! committed component versions in the target repository out, with inputs
//! ingested, digests computed, references resolved, and a configurable
//! conflict policy.

pub mod digests;
pub mod engine;
pub mod input;
pub mod spec;

pub use engine::{
    ConflictPolicy, ConstructionEngine, ConstructionResult, EngineOptions, Error, LifecycleHooks,
};
pub use input::{InputMethod, InputMethodRegistry};
pub use spec::ConstructorSpec;
