use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// How to retrieve a resource's bytes. The two built-in variants cover blobs
/// stored next to the component descriptor and images living in some OCI
/// registry; anything else rides along as a raw typed object so descriptors
/// with extension access kinds survive a round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessSpec {
    LocalBlob {
        media_type: String,
        local_reference: String,
    },
    OciImage {
        image_reference: String,
    },
    Other(Value),
}

pub const KIND_LOCAL_BLOB: &str = "localBlob/v1";
pub const KIND_OCI_IMAGE: &str = "ociImage/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotAnObject,
    MissingType,
    MissingField(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl AccessSpec {
    pub fn local_blob(media_type: impl Into<String>, local_reference: impl Into<String>) -> Self {
        AccessSpec::LocalBlob {
            media_type: media_type.into(),
            local_reference: local_reference.into(),
        }
    }

    pub fn oci_image(image_reference: impl Into<String>) -> Self {
        AccessSpec::OciImage {
            image_reference: image_reference.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            AccessSpec::LocalBlob { .. } => KIND_LOCAL_BLOB,
            AccessSpec::OciImage { .. } => KIND_OCI_IMAGE,
            AccessSpec::Other(v) => v
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(""),
        }
    }

    pub fn from_value(value: &Value) -> Result<AccessSpec, Error> {
        let obj = value.as_object().ok_or(Error::NotAnObject)?;
        let typ = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(Error::MissingType)?;
        // accept the unversioned forms too
        let kind = typ.split('/').next().unwrap_or(typ);
        match kind {
            "localBlob" => Ok(AccessSpec::LocalBlob {
                media_type: obj
                    .get("mediaType")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                local_reference: obj
                    .get("localReference")
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField("localReference"))?
                    .to_string(),
            }),
            "ociImage" | "ociArtifact" => Ok(AccessSpec::OciImage {
                image_reference: obj
                    .get("imageReference")
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField("imageReference"))?
                    .to_string(),
            }),
            _ => Ok(AccessSpec::Other(value.clone())),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            AccessSpec::LocalBlob {
                media_type,
                local_reference,
            } => serde_json::json!({
                "type": KIND_LOCAL_BLOB,
                "mediaType": media_type,
                "localReference": local_reference,
            }),
            AccessSpec::OciImage { image_reference } => serde_json::json!({
                "type": KIND_OCI_IMAGE,
                "imageReference": image_reference,
            }),
            AccessSpec::Other(v) => v.clone(),
        }
    }
}

impl Serialize for AccessSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AccessSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        AccessSpec::from_value(&value).map_err(D::Error::custom)
    }
}
