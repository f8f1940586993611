//! Directed acyclic graph of component versions: arena storage keyed by a
//! totally-ordered key, concurrent discovery, and streaming renderers.

pub mod component;
pub mod discover;
pub mod graph;
pub mod render;

pub use component::{component_key, discover_components};
pub use discover::{DiscoverOptions, discover};
pub use graph::{Attributes, Dag, DiscoveryState, Error, Vertex};
pub use render::{Format, LiveRenderer, render};
