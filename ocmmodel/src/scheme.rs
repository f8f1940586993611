use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::typed::TypeName;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotAnObject,
    MissingType,
    BadTypeName(String),
    UnknownKind(String),
    Convert(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

type ConvertFn = dyn Fn(&Value) -> Result<Value, Error> + Send + Sync;

struct Entry {
    canonical: TypeName,
    convert: Arc<ConvertFn>,
}

/// Registry of typed specifications keyed by `(kind, version)`.
///
/// A registration installs a canonical type name plus any number of aliases
/// (including unversioned forms) and a conversion function that normalizes
/// the raw object to the canonical representation. Conversion is idempotent:
/// converting an already-converted value yields the same value.
///
/// Unknown kinds fail with [Error::UnknownKind] unless `allow_unknown` is
/// set, in which case the value passes through untouched.
pub struct SchemeRegistry {
    entries: HashMap<TypeName, Entry>,
    default_kind: Option<TypeName>,
    allow_unknown: bool,
}

impl Default for SchemeRegistry {
    fn default() -> SchemeRegistry {
        SchemeRegistry {
            entries: HashMap::new(),
            default_kind: None,
            allow_unknown: false,
        }
    }
}

impl SchemeRegistry {
    pub fn new() -> SchemeRegistry {
        SchemeRegistry::default()
    }

    pub fn allow_unknown(mut self, allow: bool) -> SchemeRegistry {
        self.allow_unknown = allow;
        self
    }

    /// Install `canonical` under its own name and every alias. The identity
    /// conversion is used when `convert` is `None`.
    pub fn register(
        &mut self,
        canonical: TypeName,
        aliases: &[&str],
        convert: Option<Arc<ConvertFn>>,
    ) {
        let convert = convert.unwrap_or_else(|| Arc::new(|v: &Value| Ok(v.clone())));
        let mut names = vec![canonical.clone()];
        for alias in aliases {
            if let Ok(name) = alias.parse::<TypeName>() {
                names.push(name);
            }
        }
        // the unversioned form of the canonical name is accepted too
        if canonical.version.is_some() {
            names.push(TypeName::new(canonical.kind.clone()));
        }
        for name in names {
            self.entries.insert(
                name,
                Entry {
                    canonical: canonical.clone(),
                    convert: convert.clone(),
                },
            );
        }
    }

    /// The kind assumed when a value carries no `type` field.
    pub fn set_default(&mut self, kind: TypeName) {
        self.default_kind = Some(kind);
    }

    pub fn canonical_for(&self, name: &TypeName) -> Option<&TypeName> {
        self.entries.get(name).map(|e| &e.canonical)
    }

    pub fn contains(&self, name: &TypeName) -> bool {
        self.entries.contains_key(name)
    }

    fn type_of(&self, value: &Value) -> Result<TypeName, Error> {
        let obj = value.as_object().ok_or(Error::NotAnObject)?;
        match obj.get("type") {
            Some(Value::String(s)) => {
                s.parse().map_err(|_| Error::BadTypeName(s.to_string()))
            }
            Some(other) => Err(Error::BadTypeName(other.to_string())),
            None => self.default_kind.clone().ok_or(Error::MissingType),
        }
    }

    /// Normalize a typed value: resolve the alias to the canonical name, run
    /// the registered conversion, and rewrite the `type` field.
    pub fn convert(&self, value: &Value) -> Result<Value, Error> {
        let name = self.type_of(value)?;
        let Some(entry) = self.entries.get(&name) else {
            if self.allow_unknown {
                return Ok(value.clone());
            }
            return Err(Error::UnknownKind(name.to_string()));
        };
        let mut converted = (entry.convert)(value)?;
        if let Some(obj) = converted.as_object_mut() {
            obj.insert(
                "type".to_string(),
                Value::String(entry.canonical.to_string()),
            );
        }
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemeRegistry {
        let mut r = SchemeRegistry::new();
        r.register(
            TypeName::versioned("OCIRepository", "v1"),
            &["OCIRegistry/v1", "ociRegistry/v1", "OCI/v1", "oci/v1", "OCIRegistry", "oci"],
            None,
        );
        r
    }

    #[test]
    fn test_alias_resolution() {
        let r = registry();
        for alias in ["OCIRegistry/v1", "oci/v1", "OCIRepository", "oci"] {
            let name: TypeName = alias.parse().unwrap();
            assert_eq!(
                r.canonical_for(&name).unwrap(),
                &TypeName::versioned("OCIRepository", "v1"),
                "{alias}"
            );
        }
        assert!(r.canonical_for(&TypeName::new("nope")).is_none());
    }

    #[test]
    fn test_convert_idempotent() {
        let r = registry();
        let raw = json!({"type": "oci/v1", "baseUrl": "https://example.com"});
        let once = r.convert(&raw).unwrap();
        assert_eq!(once["type"], "OCIRepository/v1");
        assert_eq!(once["baseUrl"], "https://example.com");
        let twice = r.convert(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unknown_kind() {
        let r = registry();
        let raw = json!({"type": "mystery/v1"});
        assert!(matches!(r.convert(&raw), Err(Error::UnknownKind(_))));

        let lenient = registry().allow_unknown(true);
        assert_eq!(lenient.convert(&raw).unwrap(), raw);
    }

    #[test]
    fn test_default_kind() {
        let mut r = registry();
        let raw = json!({"baseUrl": "https://example.com"});
        assert!(matches!(r.convert(&raw), Err(Error::MissingType)));
        r.set_default(TypeName::versioned("OCIRepository", "v1"));
        assert_eq!(r.convert(&raw).unwrap()["type"], "OCIRepository/v1");
    }
}
