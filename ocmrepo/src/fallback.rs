use std::sync::Arc;

use log::trace;

use ocmmodel::descriptor::ComponentDescriptor;
use ocmmodel::repospec::RepositorySpec;

use crate::provider::RepositoryProvider;
use crate::repository::Error;

/// One lookup source: a repository specification, an optional component-name
/// prefix that gates it, and a priority.
#[derive(Debug, Clone)]
pub struct FallbackEntry {
    pub spec: RepositorySpec,
    pub prefix: String,
    pub priority: i32,
}

impl FallbackEntry {
    pub fn new(spec: RepositorySpec, prefix: impl Into<String>, priority: i32) -> FallbackEntry {
        FallbackEntry {
            spec,
            prefix: prefix.into(),
            priority,
        }
    }

    /// A non-empty prefix only matches whole segments: `ocm.software`
    /// matches `ocm.software/cli` but not `ocm.software-fork/cli`.
    fn matches(&self, component: &str) -> bool {
        if self.prefix.is_empty() {
            return true;
        }
        match component.strip_prefix(&self.prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

/// Priority- and prefix-ordered lookup across multiple repositories.
///
/// Entries are consulted in descending priority. Within one priority the
/// declaration order is preserved and guaranteed stable, so callers may rely
/// on it for tie-breaking. A not-found moves on to the next entry; transport
/// and backend errors stop the walk.
pub struct FallbackRepository {
    provider: Arc<RepositoryProvider>,
    entries: Vec<FallbackEntry>,
}

impl FallbackRepository {
    pub fn new(provider: Arc<RepositoryProvider>, mut entries: Vec<FallbackEntry>) -> Self {
        // stable sort keeps declaration order within equal priorities
        entries.sort_by_key(|e| std::cmp::Reverse(e.priority));
        FallbackRepository { provider, entries }
    }

    pub fn entries(&self) -> &[FallbackEntry] {
        &self.entries
    }

    pub async fn get_component_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ComponentDescriptor, Error> {
        for entry in self.entries.iter().filter(|e| e.matches(name)) {
            let repo = self.provider.get_repository(&entry.spec).await?;
            match repo.get_component_version(name, version).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) if e.not_found() => {
                    trace!("{}:{} not in {:?}, falling back", name, version, entry.spec);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ComponentVersionNotFound {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Union of the versions every matching repository knows.
    pub async fn list_component_versions(&self, name: &str) -> Result<Vec<String>, Error> {
        let mut all = Vec::new();
        for entry in self.entries.iter().filter(|e| e.matches(name)) {
            let repo = self.provider.get_repository(&entry.spec).await?;
            for version in repo.list_component_versions(name).await? {
                if !all.contains(&version) {
                    all.push(version);
                }
            }
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::ComponentVersionRepository;
    use ocmmodel::repospec::AccessMode;

    fn ctf_spec(dir: &std::path::Path, name: &str) -> RepositorySpec {
        RepositorySpec::ctf(dir.join(name), AccessMode::RDWR | AccessMode::CREATE)
    }

    async fn put(
        provider: &RepositoryProvider,
        spec: &RepositorySpec,
        name: &str,
        version: &str,
        provider_name: &str,
    ) {
        let repo = provider.get_repository(spec).await.unwrap();
        repo.add_component_version(&ComponentDescriptor::new(name, version, provider_name))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_and_fallthrough() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(RepositoryProvider::new(None).unwrap());
        let low = ctf_spec(dir.path(), "low");
        let high = ctf_spec(dir.path(), "high");

        // same component in both, different provider string to tell them apart
        put(&provider, &low, "acme/comp", "v1", "from-low").await;
        put(&provider, &high, "acme/comp", "v1", "from-high").await;
        put(&provider, &low, "acme/only-low", "v1", "from-low").await;

        let fallback = FallbackRepository::new(
            provider,
            vec![
                FallbackEntry::new(low, "", 1),
                FallbackEntry::new(high, "", 10),
            ],
        );

        let d = fallback.get_component_version("acme/comp", "v1").await.unwrap();
        assert_eq!(d.component.provider, "from-high");
        // falls through to the low-priority entry
        let d = fallback
            .get_component_version("acme/only-low", "v1")
            .await
            .unwrap();
        assert_eq!(d.component.provider, "from-low");
        assert!(
            fallback
                .get_component_version("acme/nowhere", "v1")
                .await
                .unwrap_err()
                .not_found()
        );
    }

    #[tokio::test]
    async fn test_prefix_segment_boundary() {
        let entry = FallbackEntry::new(
            RepositorySpec::oci("https://example.com"),
            "ocm.software",
            0,
        );
        assert!(entry.matches("ocm.software/cli"));
        assert!(entry.matches("ocm.software"));
        assert!(!entry.matches("ocm.software-fork/cli"));
        assert!(!entry.matches("other/cli"));
    }

    #[tokio::test]
    async fn test_declaration_order_within_priority() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(RepositoryProvider::new(None).unwrap());
        let first = ctf_spec(dir.path(), "first");
        let second = ctf_spec(dir.path(), "second");
        put(&provider, &first, "c", "v1", "from-first").await;
        put(&provider, &second, "c", "v1", "from-second").await;

        let fallback = FallbackRepository::new(
            provider,
            vec![
                FallbackEntry::new(first, "", 5),
                FallbackEntry::new(second, "", 5),
            ],
        );
        let d = fallback.get_component_version("c", "v1").await.unwrap();
        assert_eq!(d.component.provider, "from-first");
    }
}
