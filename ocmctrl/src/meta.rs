use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata projection of an API object. This is all that ever enters the
/// informer caches; full payloads are not retained.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialObjectMeta {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl PartialObjectMeta {
    /// Project a full API object (`{kind, apiVersion, metadata: {...}}`)
    /// down to partial metadata, dropping spec/status/data payloads.
    pub fn project(object: &Value) -> PartialObjectMeta {
        let meta = object.get("metadata").cloned().unwrap_or(Value::Null);
        let str_of = |v: &Value, k: &str| {
            v.get(k)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let map_of = |k: &str| -> BTreeMap<String, String> {
            meta.get(k)
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };
        PartialObjectMeta {
            kind: str_of(object, "kind"),
            api_version: str_of(object, "apiVersion"),
            name: str_of(&meta, "name"),
            namespace: str_of(&meta, "namespace"),
            uid: str_of(&meta, "uid"),
            resource_version: str_of(&meta, "resourceVersion"),
            generation: meta
                .get("generation")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            creation_timestamp: meta
                .get("creationTimestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            deletion_timestamp: meta
                .get("deletionTimestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            labels: map_of("labels"),
            annotations: map_of("annotations"),
            owner_references: meta
                .get("ownerReferences")
                .and_then(Value::as_array)
                .map(|refs| {
                    refs.iter()
                        .map(|r| OwnerReference {
                            api_version: str_of(r, "apiVersion"),
                            kind: str_of(r, "kind"),
                            name: str_of(r, "name"),
                            uid: str_of(r, "uid"),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            finalizers: meta
                .get("finalizers")
                .and_then(Value::as_array)
                .map(|fs| {
                    fs.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Informer-level events, already projected.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(PartialObjectMeta),
    Modified(PartialObjectMeta),
    Deleted(PartialObjectMeta),
}

impl WatchEvent {
    pub fn meta(&self) -> &PartialObjectMeta {
        match self {
            WatchEvent::Added(m) | WatchEvent::Modified(m) | WatchEvent::Deleted(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_drops_payload() {
        let object = json!({
            "kind": "Component",
            "apiVersion": "delivery.ocm.software/v1alpha1",
            "metadata": {
                "name": "app",
                "namespace": "prod",
                "uid": "u-1",
                "resourceVersion": "42",
                "generation": 3,
                "creationTimestamp": "2024-05-01T12:00:00Z",
                "labels": {"app": "x"},
                "annotations": {"note": "y"},
                "finalizers": ["f1"],
                "ownerReferences": [
                    {"apiVersion": "v1", "kind": "Owner", "name": "o", "uid": "u-0"}
                ]
            },
            "spec": {"huge": "payload"},
            "status": {"also": "dropped"}
        });
        let meta = PartialObjectMeta::project(&object);
        assert_eq!(meta.kind, "Component");
        assert_eq!(meta.name, "app");
        assert_eq!(meta.namespace, "prod");
        assert_eq!(meta.generation, 3);
        assert_eq!(meta.labels["app"], "x");
        assert_eq!(meta.owner_references[0].kind, "Owner");
        assert_eq!(meta.finalizers, vec!["f1"]);
        assert!(meta.creation_timestamp.is_some());
        // nothing of spec/status survives serialization
        let round = serde_json::to_string(&meta).unwrap();
        assert!(!round.contains("payload"));
        assert!(!round.contains("dropped"));
    }

    #[test]
    fn test_project_tolerates_missing_fields() {
        let meta = PartialObjectMeta::project(&json!({"kind": "Thing"}));
        assert_eq!(meta.kind, "Thing");
        assert_eq!(meta.name, "");
        assert_eq!(meta.generation, 0);
        assert!(meta.labels.is_empty());
    }
}
