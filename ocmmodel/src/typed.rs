use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    EmptyKind,
    EmptyVersion,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Discriminator of a typed value: `kind` or `kind/version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeName {
    pub kind: String,
    pub version: Option<String>,
}

impl TypeName {
    pub fn new(kind: impl Into<String>) -> TypeName {
        TypeName {
            kind: kind.into(),
            version: None,
        }
    }

    pub fn versioned(kind: impl Into<String>, version: impl Into<String>) -> TypeName {
        TypeName {
            kind: kind.into(),
            version: Some(version.into()),
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{}", self.kind, v),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::str::FromStr for TypeName {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.split_once('/') {
            Some((kind, _)) if kind.is_empty() => Err(Error::EmptyKind),
            Some((_, version)) if version.is_empty() => Err(Error::EmptyVersion),
            Some((kind, version)) => Ok(TypeName::versioned(kind, version)),
            None if s.is_empty() => Err(Error::EmptyKind),
            None => Ok(TypeName::new(s)),
        }
    }
}

impl Serialize for TypeName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TypeName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            "OCIRepository/v1".parse::<TypeName>().unwrap(),
            TypeName::versioned("OCIRepository", "v1")
        );
        assert_eq!("ctf".parse::<TypeName>().unwrap(), TypeName::new("ctf"));
        assert_eq!("".parse::<TypeName>(), Err(Error::EmptyKind));
        assert_eq!("/v1".parse::<TypeName>(), Err(Error::EmptyKind));
        assert_eq!("x/".parse::<TypeName>(), Err(Error::EmptyVersion));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["OCIRepository/v1", "localBlob"] {
            assert_eq!(s.parse::<TypeName>().unwrap().to_string(), s);
        }
    }
}
