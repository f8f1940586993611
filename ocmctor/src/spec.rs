use serde::{Deserialize, Serialize};
use serde_json::Value;

use ocmmodel::access::AccessSpec;
use ocmmodel::descriptor::Label;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Yaml(#[from] serde_yaml::Error),
    Json(#[from] serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The declarative input of the construction engine: a list of components to
/// materialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructorSpec {
    pub components: Vec<ComponentSpec>,
}

impl ConstructorSpec {
    pub fn from_yaml(data: &str) -> Result<ConstructorSpec, Error> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn from_json(data: &str) -> Result<ConstructorSpec, Error> {
        Ok(serde_json::from_str(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,
    pub version: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSpec>,
    #[serde(
        rename = "componentReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub references: Vec<ReferenceSpec>,
}

/// A resource is declared either via `input` (an input method materializes
/// the content locally) or via `access` (the content lives elsewhere).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub name: String,
    /// defaults to the component version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSpec {
    pub name: String,
    pub component_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml() {
        let spec = ConstructorSpec::from_yaml(
            r#"
components:
  - name: acme/app
    version: v1.0.0
    provider: acme.org
    resources:
      - name: config
        type: blob
        input:
          type: utf8
          text: "hello"
      - name: image
        type: ociImage
        access:
          type: ociImage/v1
          imageReference: ghcr.io/acme/app:1.0
    componentReferences:
      - name: base
        componentName: acme/base
        version: v2.0.0
"#,
        )
        .unwrap();
        assert_eq!(spec.components.len(), 1);
        let c = &spec.components[0];
        assert_eq!(c.resources.len(), 2);
        assert!(c.resources[0].input.is_some());
        assert_eq!(
            c.resources[1].access,
            Some(AccessSpec::oci_image("ghcr.io/acme/app:1.0"))
        );
        assert_eq!(c.references[0].component_name, "acme/base");
    }
}
