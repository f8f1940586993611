use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessSpec;
use crate::digest::Digest;
use crate::identity::Identity;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    EmptyName,
    EmptyVersion,
    EmptyProvider,
    DuplicateResourceIdentity(String),
    DuplicateSourceIdentity(String),
    LocalResourceWithoutAccess(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub const SCHEMA_VERSION: &str = "v2";

/// The descriptor document of a component version, OCM v2 wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub meta: Meta,
    pub component: Component,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub schema_version: String,
}

impl Default for Meta {
    fn default() -> Meta {
        Meta {
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    pub version: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(
        rename = "componentReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub references: Vec<ComponentReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: Value,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Label {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub relation: Relation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReference {
    pub name: String,
    pub component_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl ComponentDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        provider: impl Into<String>,
    ) -> ComponentDescriptor {
        ComponentDescriptor {
            meta: Meta::default(),
            component: Component {
                name: name.into(),
                version: version.into(),
                provider: provider.into(),
                labels: Vec::new(),
                resources: Vec::new(),
                sources: Vec::new(),
                references: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.component.name
    }

    pub fn version(&self) -> &str {
        &self.component.version
    }

    /// Identity is `(name, version)`.
    pub fn identity(&self) -> (String, String) {
        (
            self.component.name.clone(),
            self.component.version.clone(),
        )
    }

    pub fn label(&self, name: &str) -> Option<&Value> {
        self.component
            .labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| &l.value)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.component.name.is_empty() {
            return Err(Error::EmptyName);
        }
        if self.component.version.is_empty() {
            return Err(Error::EmptyVersion);
        }
        if self.component.provider.is_empty() {
            return Err(Error::EmptyProvider);
        }
        let mut seen = std::collections::HashSet::new();
        for r in &self.component.resources {
            if !seen.insert((r.name.clone(), r.version.clone())) {
                return Err(Error::DuplicateResourceIdentity(format!(
                    "{}:{}",
                    r.name, r.version
                )));
            }
            // a local resource without an access has no retrievable bytes
            if r.relation == Relation::Local && r.access.is_none() {
                return Err(Error::LocalResourceWithoutAccess(format!(
                    "{}:{}",
                    r.name, r.version
                )));
            }
        }
        seen.clear();
        for s in &self.component.sources {
            if !seen.insert((s.name.clone(), s.version.clone())) {
                return Err(Error::DuplicateSourceIdentity(format!(
                    "{}:{}",
                    s.name, s.version
                )));
            }
        }
        Ok(())
    }

    pub fn find_resource(&self, identity: &Identity) -> Option<&Resource> {
        self.component
            .resources
            .iter()
            .find(|r| identity.subset_of(&r.identity()))
    }

    pub fn find_source(&self, identity: &Identity) -> Option<&Source> {
        self.component
            .sources
            .iter()
            .find(|s| identity.subset_of(&s.identity()))
    }
}

impl Resource {
    pub fn identity(&self) -> Identity {
        Identity::new()
            .with("name", &self.name)
            .with("version", &self.version)
    }
}

impl Source {
    pub fn identity(&self) -> Identity {
        Identity::new()
            .with("name", &self.name)
            .with("version", &self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ComponentDescriptor {
        let mut d = ComponentDescriptor::new("test-component", "v1.0.0", "ocm.software/test");
        d.component.resources.push(Resource {
            name: "data".to_string(),
            version: "v1.0.0".to_string(),
            typ: "blob".to_string(),
            relation: Relation::Local,
            access: Some(AccessSpec::local_blob(
                "application/octet-stream",
                "sha256:c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2",
            )),
            digest: Some(Digest::sha256_of("foobar")),
            creation_time: None,
            labels: Vec::new(),
        });
        d
    }

    #[test]
    fn test_serde_roundtrip() {
        let d = descriptor();
        let json = serde_json::to_string(&d).unwrap();
        let back: ComponentDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        // wire field names are camelCase
        assert!(json.contains("\"schemaVersion\":\"v2\""));
        // empty reference lists are omitted from the wire form
        assert!(!json.contains("\"componentReferences\""));
    }

    #[test]
    fn test_validate() {
        assert!(descriptor().validate().is_ok());
        let mut d = descriptor();
        d.component.name.clear();
        assert_eq!(d.validate(), Err(Error::EmptyName));
        let mut d = descriptor();
        let dup = d.component.resources[0].clone();
        d.component.resources.push(dup);
        assert!(matches!(
            d.validate(),
            Err(Error::DuplicateResourceIdentity(_))
        ));
        let mut d = descriptor();
        d.component.resources[0].access = None;
        assert!(matches!(
            d.validate(),
            Err(Error::LocalResourceWithoutAccess(_))
        ));
        // an external resource may legitimately carry no access yet
        let mut d = descriptor();
        d.component.resources[0].relation = Relation::External;
        d.component.resources[0].access = None;
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_find_resource_subset_match() {
        let d = descriptor();
        let by_name = Identity::new().with("name", "data");
        assert!(d.find_resource(&by_name).is_some());
        let wrong = Identity::new().with("name", "data").with("version", "v2");
        assert!(d.find_resource(&wrong).is_none());
    }
}
