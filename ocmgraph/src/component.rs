//! Discovery of component-version graphs: vertices are `name:version` keys,
//! edges follow the component references of each retrieved descriptor.

use std::sync::Arc;

use serde_json::json;

use ocmrepo::FallbackRepository;

use crate::discover::{DiscoverOptions, discover};
use crate::graph::{Dag, Error};

/// Canonical vertex key of a component version.
pub fn component_key(name: &str, version: &str) -> String {
    format!("{name}:{version}")
}

fn split_key(key: &str) -> Option<(String, String)> {
    key.rsplit_once(':')
        .map(|(n, v)| (n.to_string(), v.to_string()))
}

/// Walk the reference closure of `roots` through the resolver, building the
/// DAG as it goes. Each completed vertex carries a small summary value
/// (provider, resource and reference counts); a version the resolver cannot
/// find marks its vertex failed without stopping the rest of the walk.
pub async fn discover_components(
    dag: Arc<Dag<String>>,
    resolver: Arc<FallbackRepository>,
    roots: Vec<(String, String)>,
    options: DiscoverOptions,
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
) -> Result<(), Error> {
    let root_keys = roots
        .iter()
        .map(|(n, v)| component_key(n, v))
        .collect::<Vec<_>>();

    let value_dag = dag.clone();
    discover(
        dag,
        root_keys,
        move |key: String| {
            let resolver = resolver.clone();
            let value_dag = value_dag.clone();
            async move {
                let (name, version) =
                    split_key(&key).ok_or_else(|| format!("bad component key {key}"))?;
                let descriptor = resolver
                    .get_component_version(&name, &version)
                    .await
                    .map_err(|e| e.to_string())?;
                let _ = value_dag.set_value(
                    &key,
                    json!({
                        "provider": descriptor.component.provider,
                        "resources": descriptor.component.resources.len(),
                        "references": descriptor.component.references.len(),
                    }),
                );
                Ok(descriptor
                    .component
                    .references
                    .iter()
                    .map(|r| component_key(&r.component_name, &r.version))
                    .collect())
            }
        },
        options,
        cancel,
    )
    .await
}
