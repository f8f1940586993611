use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use ocmmodel::descriptor::{
    ComponentDescriptor, ComponentReference, Relation, Resource, Source,
};
use ocmmodel::digest::Digest;
use ocmrepo::repository::{ComponentVersionRepository, ResourceRepository};
use ocmrepo::FallbackRepository;

use crate::digests::DigestProcessorRegistry;
use crate::input::InputMethodRegistry;
use crate::spec::{ComponentSpec, ConstructorSpec, ResourceSpec, SourceSpec};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Conflict { name: String, version: String },
    ResourceNeedsInputOrAccess { component: String, resource: String },
    Input(#[from] crate::input::Error),
    DigestProcessor(#[from] crate::digests::Error),
    Repository(#[from] ocmrepo::Error),
    Blob(#[from] ocmblob::Error),
    Json(#[from] serde_json::Error),
    Hook(String),
    // the descriptor lacks resource digests, so its own digest would not be
    // authoritative
    HashUnstable { name: String, version: String },
    Cancelled,
    Summary(Vec<(String, Error)>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Conflict { name, version } => {
                write!(f, "component version already exists: {name}:{version}")
            }
            Error::Summary(errors) => {
                write!(f, "{} component(s) failed:", errors.len())?;
                for (component, e) in errors {
                    write!(f, " [{component}: {e}]")?;
                }
                Ok(())
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// What to do when the target already has the `(name, version)` being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    AbortAndFail,
    Skip,
    Replace,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "abort-and-fail" => Ok(ConflictPolicy::AbortAndFail),
            "skip" => Ok(ConflictPolicy::Skip),
            "replace" => Ok(ConflictPolicy::Replace),
            other => Err(format!("unknown conflict policy {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub concurrency_limit: usize,
    pub conflict_policy: ConflictPolicy,
    pub skip_reference_digest_processing: bool,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            concurrency_limit: 4,
            conflict_policy: ConflictPolicy::default(),
            skip_reference_digest_processing: false,
        }
    }
}

/// Lifecycle callbacks, fired exactly once per component attempt. `on_end`
/// runs in completion order, which is not the declaration order. Errors
/// returned by hooks join the run's summary error.
pub trait LifecycleHooks: Send + Sync {
    fn on_start(&self, component: &str) -> Result<(), String> {
        let _ = component;
        Ok(())
    }

    fn on_end(
        &self,
        component: &str,
        descriptor: Option<&ComponentDescriptor>,
        error: Option<&Error>,
    ) -> Result<(), String> {
        let _ = (component, descriptor, error);
        Ok(())
    }
}

struct NoHooks;

impl LifecycleHooks for NoHooks {}

#[derive(Debug)]
pub struct ConstructionResult {
    pub committed: Vec<ComponentDescriptor>,
    pub skipped: Vec<(String, String)>,
}

enum Outcome {
    Committed(ComponentDescriptor),
    Skipped,
}

/// Turns a constructor spec into committed component versions, dispatching
/// up to `concurrency_limit` components at a time. Within one component the
/// inputs run sequentially; across components nothing is ordered.
#[derive(Clone)]
pub struct ConstructionEngine {
    target: Arc<dyn ComponentVersionRepository>,
    inputs: Arc<InputMethodRegistry>,
    digest_processors: Arc<DigestProcessorRegistry>,
    resource_repositories: Arc<HashMap<String, Arc<dyn ResourceRepository>>>,
    external: Option<Arc<FallbackRepository>>,
    hooks: Arc<dyn LifecycleHooks>,
    options: EngineOptions,
}

impl ConstructionEngine {
    pub fn new(target: Arc<dyn ComponentVersionRepository>) -> ConstructionEngine {
        ConstructionEngine {
            target,
            inputs: Arc::new(InputMethodRegistry::new()),
            digest_processors: Arc::new(DigestProcessorRegistry::new()),
            resource_repositories: Arc::new(HashMap::new()),
            external: None,
            hooks: Arc::new(NoHooks),
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_inputs(mut self, inputs: InputMethodRegistry) -> Self {
        self.inputs = Arc::new(inputs);
        self
    }

    pub fn with_external(mut self, external: Arc<FallbackRepository>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_resource_repository(
        mut self,
        kind: impl Into<String>,
        repo: Arc<dyn ResourceRepository>,
    ) -> Self {
        Arc::make_mut(&mut self.resource_repositories).insert(kind.into(), repo);
        self
    }

    pub async fn construct(&self, spec: &ConstructorSpec) -> Result<ConstructionResult, Error> {
        let semaphore = Arc::new(Semaphore::new(std::cmp::max(1, self.options.concurrency_limit)));
        let mut set: JoinSet<(String, String, Result<Outcome, Error>)> = JoinSet::new();

        for component in spec.components.iter().cloned() {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let name = component.name.clone();
                let version = component.version.clone();
                let result = match semaphore.acquire().await {
                    Ok(_permit) => engine.run_component(component).await,
                    Err(_) => Err(Error::Cancelled),
                };
                (name, version, result)
            });
        }

        let mut committed = Vec::new();
        let mut skipped = Vec::new();
        let mut errors: Vec<(String, Error)> = Vec::new();
        let mut abort = false;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, version, Ok(Outcome::Committed(descriptor)))) => {
                    info!("component {name}:{version} end ok");
                    committed.push(descriptor);
                }
                Ok((name, version, Ok(Outcome::Skipped))) => {
                    info!("component {name}:{version} skipped");
                    skipped.push((name, version));
                }
                Ok((name, version, Err(e))) => {
                    error!("component {name}:{version} end err: {e}");
                    if matches!(e, Error::Conflict { .. })
                        && self.options.conflict_policy == ConflictPolicy::AbortAndFail
                    {
                        abort = true;
                    }
                    errors.push((format!("{name}:{version}"), e));
                    if abort {
                        set.abort_all();
                    }
                }
                Err(join_error) if join_error.is_cancelled() => {
                    // aborted above, nothing to record
                }
                Err(join_error) => {
                    errors.push(("<task>".to_string(), Error::Hook(join_error.to_string())));
                }
            }
        }

        if errors.is_empty() {
            Ok(ConstructionResult { committed, skipped })
        } else {
            Err(Error::Summary(errors))
        }
    }

    async fn run_component(&self, component: ComponentSpec) -> Result<Outcome, Error> {
        let name = component.name.clone();
        info!("component {name}:{} start", component.version);
        let result = match self.hooks.on_start(&name) {
            Ok(()) => self.build_component(&component).await,
            Err(e) => Err(Error::Hook(e)),
        };

        let (descriptor, error) = match &result {
            Ok(Outcome::Committed(d)) => (Some(d), None),
            Ok(Outcome::Skipped) => (None, None),
            Err(e) => (None, Some(e)),
        };
        if let Err(e) = self.hooks.on_end(&name, descriptor, error) {
            // the component result wins; a hook failure only surfaces when
            // the component itself succeeded
            return match result {
                Ok(_) => Err(Error::Hook(e)),
                Err(err) => Err(err),
            };
        }
        result
    }

    async fn build_component(&self, component: &ComponentSpec) -> Result<Outcome, Error> {
        let name = &component.name;
        let version = &component.version;

        if self.options.conflict_policy != ConflictPolicy::Replace {
            match self.target.get_component_version(name, version).await {
                Ok(_) => {
                    return match self.options.conflict_policy {
                        ConflictPolicy::Skip => Ok(Outcome::Skipped),
                        _ => Err(Error::Conflict {
                            name: name.clone(),
                            version: version.clone(),
                        }),
                    };
                }
                Err(e) if e.not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut descriptor = ComponentDescriptor::new(name, version, &component.provider);
        descriptor.component.labels = component.labels.clone();

        // input methods run sequentially within one component
        for rspec in &component.resources {
            let resource = self.build_resource(name, version, rspec).await?;
            descriptor.component.resources.push(resource);
        }
        for sspec in &component.sources {
            let source = self.build_source(name, version, sspec).await?;
            descriptor.component.sources.push(source);
        }
        for rspec in &component.references {
            descriptor
                .component
                .references
                .push(self.build_reference(rspec).await?);
        }

        self.target.add_component_version(&descriptor).await?;
        Ok(Outcome::Committed(descriptor))
    }

    async fn build_resource(
        &self,
        component: &str,
        component_version: &str,
        spec: &ResourceSpec,
    ) -> Result<Resource, Error> {
        let mut resource = Resource {
            name: spec.name.clone(),
            version: spec
                .version
                .clone()
                .unwrap_or_else(|| component_version.to_string()),
            typ: spec.typ.clone(),
            relation: if spec.input.is_some() {
                Relation::Local
            } else {
                Relation::External
            },
            access: spec.access.clone(),
            digest: None,
            creation_time: Some(Utc::now()),
            labels: spec.labels.clone(),
        };

        if let Some(input) = &spec.input {
            let blob = self.inputs.blob(input).await?;
            resource = self
                .target
                .add_local_resource(component, component_version, &resource, blob.as_ref())
                .await?;
        } else if let Some(access) = &spec.access {
            let kind = access.kind().to_string();
            if let Some(repo) = self.resource_repositories.get(&kind) {
                let blob = repo.download_resource(&resource).await?;
                resource = repo.upload_resource(&resource, blob.as_ref()).await?;
            }
            if let Some(processor) = self.digest_processors.get(&kind) {
                resource = processor.process(&resource).await?;
            }
        } else {
            return Err(Error::ResourceNeedsInputOrAccess {
                component: component.to_string(),
                resource: spec.name.clone(),
            });
        }
        Ok(resource)
    }

    async fn build_source(
        &self,
        component: &str,
        component_version: &str,
        spec: &SourceSpec,
    ) -> Result<Source, Error> {
        let mut source = Source {
            name: spec.name.clone(),
            version: spec
                .version
                .clone()
                .unwrap_or_else(|| component_version.to_string()),
            typ: spec.typ.clone(),
            access: spec.access.clone(),
            digest: None,
            labels: spec.labels.clone(),
        };
        if let Some(input) = &spec.input {
            let blob = self.inputs.blob(input).await?;
            source = self
                .target
                .add_local_source(component, component_version, &source, blob.as_ref())
                .await?;
        } else if spec.access.is_none() {
            return Err(Error::ResourceNeedsInputOrAccess {
                component: component.to_string(),
                resource: spec.name.clone(),
            });
        }
        Ok(source)
    }

    async fn build_reference(
        &self,
        spec: &crate::spec::ReferenceSpec,
    ) -> Result<ComponentReference, Error> {
        let mut reference = ComponentReference {
            name: spec.name.clone(),
            component_name: spec.component_name.clone(),
            version: spec.version.clone(),
            digest: None,
            labels: spec.labels.clone(),
        };
        if !self.options.skip_reference_digest_processing
            && let Some(external) = &self.external
        {
            let descriptor = external
                .get_component_version(&spec.component_name, &spec.version)
                .await?;
            reference.digest = Some(descriptor_digest(&descriptor)?);
        }
        Ok(reference)
    }
}

/// Canonical digest of a descriptor document, used for reference digests.
/// A descriptor whose resources lack digests cannot be hashed
/// authoritatively, since the same content could hash differently once the
/// digests get filled in.
pub fn descriptor_digest(descriptor: &ComponentDescriptor) -> Result<Digest, Error> {
    if descriptor
        .component
        .resources
        .iter()
        .any(|r| r.digest.is_none())
    {
        return Err(Error::HashUnstable {
            name: descriptor.name().to_string(),
            version: descriptor.version().to_string(),
        });
    }
    Ok(Digest::sha256_of(serde_json::to_vec(descriptor)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ocmrepo::provider::RepositoryProvider;
    use ocmrepo::{FallbackEntry, FallbackRepository};
    use ocmmodel::identity::Identity;
    use ocmmodel::repospec::{AccessMode, RepositorySpec};

    async fn target(
        dir: &std::path::Path,
    ) -> (Arc<RepositoryProvider>, RepositorySpec, Arc<dyn ComponentVersionRepository>) {
        let provider = Arc::new(RepositoryProvider::new(None).unwrap());
        let spec = RepositorySpec::ctf(dir.join("ctf"), AccessMode::RDWR | AccessMode::CREATE);
        let repo = provider.get_repository(&spec).await.unwrap();
        (provider, spec, repo)
    }

    fn one_component(name: &str, version: &str) -> ConstructorSpec {
        ConstructorSpec::from_yaml(&format!(
            r#"
components:
  - name: {name}
    version: {version}
    provider: acme.org
    resources:
      - name: config
        type: blob
        input:
          type: utf8
          text: "foobar"
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_construct_with_input_resource() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, repo) = target(dir.path()).await;
        let engine = ConstructionEngine::new(repo.clone());
        let result = engine.construct(&one_component("acme/app", "v1.0.0")).await.unwrap();
        assert_eq!(result.committed.len(), 1);

        let committed = &result.committed[0];
        let resource = &committed.component.resources[0];
        assert_eq!(
            resource.digest.as_ref().unwrap(),
            &Digest::sha256_of("foobar")
        );
        assert_eq!(resource.relation, Relation::Local);

        // round-trip through the repository keeps the digests
        let stored = repo.get_component_version("acme/app", "v1.0.0").await.unwrap();
        assert_eq!(&stored, committed);
        let (blob, _) = repo
            .get_local_resource("acme/app", "v1.0.0", &Identity::new().with("name", "config"))
            .await
            .unwrap();
        let mut data = Vec::new();
        use ocmblob::ReadOnlyBlob;
        use std::io::Read;
        blob.open_reader().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"foobar");
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, repo) = target(dir.path()).await;

        // seed the existing version
        let engine = ConstructionEngine::new(repo.clone());
        engine.construct(&one_component("c", "v1")).await.unwrap();
        let before = repo.get_component_version("c", "v1").await.unwrap();

        // abort-and-fail: error and target unchanged
        let engine = ConstructionEngine::new(repo.clone()).with_options(EngineOptions {
            conflict_policy: ConflictPolicy::AbortAndFail,
            ..EngineOptions::default()
        });
        let err = engine.construct(&one_component("c", "v1")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(repo.get_component_version("c", "v1").await.unwrap(), before);

        // skip: no error, no write
        let engine = ConstructionEngine::new(repo.clone()).with_options(EngineOptions {
            conflict_policy: ConflictPolicy::Skip,
            ..EngineOptions::default()
        });
        let result = engine.construct(&one_component("c", "v1")).await.unwrap();
        assert!(result.committed.is_empty());
        assert_eq!(result.skipped, vec![("c".to_string(), "v1".to_string())]);
        assert_eq!(repo.get_component_version("c", "v1").await.unwrap(), before);

        // replace: overwrites, round-trips to the new descriptor
        let engine = ConstructionEngine::new(repo.clone()).with_options(EngineOptions {
            conflict_policy: ConflictPolicy::Replace,
            ..EngineOptions::default()
        });
        let result = engine.construct(&one_component("c", "v1")).await.unwrap();
        assert_eq!(result.committed.len(), 1);
        let after = repo.get_component_version("c", "v1").await.unwrap();
        assert_eq!(after, result.committed[0]);
    }

    #[tokio::test]
    async fn test_hooks_fire_once_per_component() {
        struct Counting {
            started: AtomicUsize,
            ended: AtomicUsize,
        }
        impl LifecycleHooks for Counting {
            fn on_start(&self, _c: &str) -> Result<(), String> {
                self.started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn on_end(
                &self,
                _c: &str,
                d: Option<&ComponentDescriptor>,
                e: Option<&Error>,
            ) -> Result<(), String> {
                assert!(d.is_some() && e.is_none());
                self.ended.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (_, _, repo) = target(dir.path()).await;
        let hooks = Arc::new(Counting {
            started: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        let engine = ConstructionEngine::new(repo).with_hooks(hooks.clone());

        let mut spec = one_component("a", "v1");
        spec.components
            .extend(one_component("b", "v1").components);
        spec.components
            .extend(one_component("c", "v1").components);
        engine.construct(&spec).await.unwrap();
        assert_eq!(hooks.started.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_per_component_failure_does_not_sink_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, repo) = target(dir.path()).await;
        let engine = ConstructionEngine::new(repo.clone());

        let mut spec = one_component("good", "v1");
        // a resource with neither input nor access fails its component
        spec.components.push(
            ConstructorSpec::from_yaml(
                r#"
components:
  - name: bad
    version: v1
    provider: p
    resources:
      - name: nothing
        type: blob
"#,
            )
            .unwrap()
            .components
            .remove(0),
        );

        let err = engine.construct(&spec).await.unwrap_err();
        match err {
            Error::Summary(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].0.starts_with("bad:"));
            }
            other => panic!("expected summary, got {other:?}"),
        }
        // the good component still landed
        assert!(repo.get_component_version("good", "v1").await.is_ok());
    }

    #[tokio::test]
    async fn test_undigested_descriptor_is_hash_unstable() {
        let mut d = ComponentDescriptor::new("c", "v1", "p");
        d.component.resources.push(ocmmodel::descriptor::Resource {
            name: "r".to_string(),
            version: "v1".to_string(),
            typ: "blob".to_string(),
            relation: Relation::External,
            access: None,
            digest: None,
            creation_time: None,
            labels: Vec::new(),
        });
        assert!(matches!(
            descriptor_digest(&d),
            Err(Error::HashUnstable { .. })
        ));
    }

    #[tokio::test]
    async fn test_reference_digests_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, spec, repo) = target(dir.path()).await;

        // the referenced component lives in the same repository
        let base = ComponentDescriptor::new("acme/base", "v2.0.0", "acme.org");
        repo.add_component_version(&base).await.unwrap();

        let external = Arc::new(FallbackRepository::new(
            provider.clone(),
            vec![FallbackEntry::new(spec, "", 0)],
        ));
        let engine = ConstructionEngine::new(repo).with_external(external);

        let ctor = ConstructorSpec::from_yaml(
            r#"
components:
  - name: acme/app
    version: v1.0.0
    provider: acme.org
    componentReferences:
      - name: base
        componentName: acme/base
        version: v2.0.0
"#,
        )
        .unwrap();
        let result = engine.construct(&ctor).await.unwrap();
        let reference = &result.committed[0].component.references[0];
        assert_eq!(
            reference.digest.as_ref().unwrap(),
            &descriptor_digest(&base).unwrap()
        );
    }
}
