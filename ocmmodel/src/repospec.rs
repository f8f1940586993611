use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::{ATTR_TYPE, Identity};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    EmptyAccessMode,
    UnknownAccessMode(String),
    BadBaseUrl(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Bitmask over `{RDONLY, RDWR, CREATE}`, parsed from a `|`-delimited string
/// like `readwrite|create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMode(u8);

impl AccessMode {
    pub const RDONLY: AccessMode = AccessMode(0b001);
    pub const RDWR: AccessMode = AccessMode(0b010);
    pub const CREATE: AccessMode = AccessMode(0b100);

    pub fn contains(self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn writable(self) -> bool {
        self.contains(AccessMode::RDWR) || self.contains(AccessMode::CREATE)
    }
}

impl Default for AccessMode {
    fn default() -> AccessMode {
        AccessMode::RDONLY
    }
}

impl std::ops::BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl std::str::FromStr for AccessMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::EmptyAccessMode);
        }
        let mut mode = AccessMode(0);
        for part in s.split('|') {
            mode = mode
                | match part.trim() {
                    "readonly" => AccessMode::RDONLY,
                    "readwrite" => AccessMode::RDWR,
                    "create" => AccessMode::CREATE,
                    other => return Err(Error::UnknownAccessMode(other.to_string())),
                };
        }
        Ok(mode)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(AccessMode::RDONLY) {
            parts.push("readonly");
        }
        if self.contains(AccessMode::RDWR) {
            parts.push("readwrite");
        }
        if self.contains(AccessMode::CREATE) {
            parts.push("create");
        }
        write!(f, "{}", parts.join("|"))
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Typed repository specification, discriminated by `type`. The alias set
/// matches what the wire accepts: versioned, unversioned, and the historic
/// capitalizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RepositorySpec {
    #[serde(
        rename = "OCIRepository/v1",
        alias = "OCIRepository",
        alias = "OCIRegistry/v1",
        alias = "OCIRegistry",
        alias = "ociRegistry/v1",
        alias = "ociRegistry",
        alias = "OCI/v1",
        alias = "OCI",
        alias = "oci/v1",
        alias = "oci"
    )]
    #[serde(rename_all = "camelCase")]
    Oci { base_url: String },
    #[serde(
        rename = "CommonTransportFormat/v1",
        alias = "CommonTransportFormat",
        alias = "CTF/v1",
        alias = "CTF",
        alias = "ctf/v1",
        alias = "ctf"
    )]
    #[serde(rename_all = "camelCase")]
    Ctf {
        path: PathBuf,
        #[serde(default)]
        access_mode: AccessMode,
    },
}

impl RepositorySpec {
    pub fn oci(base_url: impl Into<String>) -> RepositorySpec {
        RepositorySpec::Oci {
            base_url: base_url.into(),
        }
    }

    pub fn ctf(path: impl Into<PathBuf>, access_mode: AccessMode) -> RepositorySpec {
        RepositorySpec::Ctf {
            path: path.into(),
            access_mode,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepositorySpec::Oci { .. } => "OCIRepository/v1",
            RepositorySpec::Ctf { .. } => "CommonTransportFormat/v1",
        }
    }

    /// The credential-consumer identity of this repository: hostname, port
    /// and path for OCI, the filesystem path for CTF.
    pub fn consumer_identity(&self) -> Result<Identity, Error> {
        match self {
            RepositorySpec::Oci { base_url } => {
                let mut id = Identity::from_url(base_url)
                    .map_err(|_| Error::BadBaseUrl(base_url.clone()))?;
                id.set(ATTR_TYPE, "OCIRepository");
                Ok(id)
            }
            RepositorySpec::Ctf { path, .. } => Ok(Identity::new()
                .with(ATTR_TYPE, "CommonTransportFormat")
                .with("path", path.to_string_lossy())),
        }
    }

    pub fn from_json(data: &str) -> Result<RepositorySpec, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn from_yaml(data: &str) -> Result<RepositorySpec, serde_yaml::Error> {
        serde_yaml::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_parse() {
        let m: AccessMode = "readwrite|create".parse().unwrap();
        assert!(m.contains(AccessMode::RDWR));
        assert!(m.contains(AccessMode::CREATE));
        assert!(!m.contains(AccessMode::RDONLY));
        assert!(m.writable());
        assert_eq!(m.to_string(), "readwrite|create");

        assert!(!"readonly".parse::<AccessMode>().unwrap().writable());
        assert_eq!("".parse::<AccessMode>(), Err(Error::EmptyAccessMode));
        assert_eq!(
            "rw".parse::<AccessMode>(),
            Err(Error::UnknownAccessMode("rw".to_string()))
        );
    }

    #[test]
    fn test_oci_aliases() {
        for t in [
            "OCIRepository/v1",
            "OCIRegistry/v1",
            "ociRegistry/v1",
            "OCI/v1",
            "oci/v1",
            "OCIRepository",
            "oci",
        ] {
            let json = format!(r#"{{"type": "{t}", "baseUrl": "https://example.com"}}"#);
            let spec = RepositorySpec::from_json(&json).unwrap();
            assert_eq!(spec, RepositorySpec::oci("https://example.com"), "{t}");
        }
    }

    #[test]
    fn test_ctf_yaml() {
        let spec = RepositorySpec::from_yaml(
            "type: CommonTransportFormat/v1\npath: /tmp/ctf\naccessMode: \"readwrite|create\"\n",
        )
        .unwrap();
        match &spec {
            RepositorySpec::Ctf { path, access_mode } => {
                assert_eq!(path, &PathBuf::from("/tmp/ctf"));
                assert!(access_mode.writable());
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn test_consumer_identity() {
        let id = RepositorySpec::oci("https://example.com:443/base")
            .consumer_identity()
            .unwrap();
        assert_eq!(id.get("hostname"), Some("example.com"));
        assert_eq!(id.get("port"), Some("443"));
        assert_eq!(id.get("path"), Some("base"));

        let id = RepositorySpec::ctf("/tmp/ctf", AccessMode::RDONLY)
            .consumer_identity()
            .unwrap();
        assert_eq!(id.get("path"), Some("/tmp/ctf"));
    }
}
