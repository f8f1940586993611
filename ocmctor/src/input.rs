use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;

use ocmblob::{Blob, FileBlob, MemoryBlob, MediaTypeOverrideable};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotAnObject,
    MissingType,
    UnknownMethod(String),
    MissingField(&'static str),
    BadBase64,
    Io(#[from] std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Produces a blob from a declared `input` object. Implementations are
/// looked up by the input's `type` field.
#[async_trait]
pub trait InputMethod: Send + Sync {
    async fn blob(&self, input: &Value) -> Result<Box<dyn Blob>, Error>;
}

/// Input methods keyed by kind; `file`, `utf8` and `binary` are built in,
/// extensions register at startup.
pub struct InputMethodRegistry {
    methods: HashMap<String, Arc<dyn InputMethod>>,
    // relative file inputs resolve against this
    working_directory: Option<PathBuf>,
}

impl Default for InputMethodRegistry {
    fn default() -> InputMethodRegistry {
        let mut registry = InputMethodRegistry {
            methods: HashMap::new(),
            working_directory: None,
        };
        registry.register("file", Arc::new(FileInput));
        registry.register("utf8", Arc::new(Utf8Input));
        registry.register("binary", Arc::new(BinaryInput));
        registry
    }
}

impl InputMethodRegistry {
    pub fn new() -> InputMethodRegistry {
        InputMethodRegistry::default()
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn register(&mut self, kind: impl Into<String>, method: Arc<dyn InputMethod>) {
        self.methods.insert(kind.into(), method);
    }

    pub async fn blob(&self, input: &Value) -> Result<Box<dyn Blob>, Error> {
        let obj = input.as_object().ok_or(Error::NotAnObject)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(Error::MissingType)?;
        // unversioned lookup, kind/v1 and kind are the same method
        let kind = kind.split('/').next().unwrap_or(kind);
        let method = self
            .methods
            .get(kind)
            .ok_or_else(|| Error::UnknownMethod(kind.to_string()))?;

        if kind == "file"
            && let Some(dir) = &self.working_directory
        {
            // rebase relative paths onto the working directory
            let mut input = input.clone();
            if let Some(path) = input.get("path").and_then(Value::as_str)
                && !path.starts_with('/')
            {
                let joined = dir.join(path).to_string_lossy().to_string();
                input["path"] = Value::String(joined);
            }
            return method.blob(&input).await;
        }
        method.blob(input).await
    }
}

fn media_type_of(input: &Value) -> Option<&str> {
    input.get("mediaType").and_then(Value::as_str)
}

struct FileInput;

#[async_trait]
impl InputMethod for FileInput {
    async fn blob(&self, input: &Value) -> Result<Box<dyn Blob>, Error> {
        let path = input
            .get("path")
            .and_then(Value::as_str)
            .ok_or(Error::MissingField("path"))?;
        // fail early instead of at first read
        tokio::fs::metadata(path).await?;
        let blob = FileBlob::new(path);
        if let Some(mt) = media_type_of(input) {
            blob.set_media_type(mt);
        }
        Ok(Box::new(blob))
    }
}

struct Utf8Input;

#[async_trait]
impl InputMethod for Utf8Input {
    async fn blob(&self, input: &Value) -> Result<Box<dyn Blob>, Error> {
        let text = input
            .get("text")
            .and_then(Value::as_str)
            .ok_or(Error::MissingField("text"))?;
        let blob = MemoryBlob::from_bytes(text.as_bytes().to_vec());
        blob.set_media_type(media_type_of(input).unwrap_or("text/plain"));
        Ok(Box::new(blob))
    }
}

struct BinaryInput;

#[async_trait]
impl InputMethod for BinaryInput {
    async fn blob(&self, input: &Value) -> Result<Box<dyn Blob>, Error> {
        let data = input
            .get("data")
            .and_then(Value::as_str)
            .ok_or(Error::MissingField("data"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| Error::BadBase64)?;
        let blob = MemoryBlob::from_bytes(decoded);
        if let Some(mt) = media_type_of(input) {
            blob.set_media_type(mt);
        }
        Ok(Box::new(blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmblob::{DigestAware, MediaTypeAware, ReadOnlyBlob};
    use serde_json::json;
    use std::io::Read;

    #[tokio::test]
    async fn test_utf8_input() {
        let registry = InputMethodRegistry::new();
        let blob = registry
            .blob(&json!({"type": "utf8", "text": "foobar"}))
            .await
            .unwrap();
        assert_eq!(
            blob.digest().unwrap(),
            ocmmodel::digest::Digest::sha256_of("foobar")
        );
        assert_eq!(blob.media_type().as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_binary_input() {
        let registry = InputMethodRegistry::new();
        let blob = registry
            .blob(&json!({"type": "binary", "data": "Zm9vYmFy", "mediaType": "application/x-thing"}))
            .await
            .unwrap();
        assert_eq!(
            blob.digest().unwrap(),
            ocmmodel::digest::Digest::sha256_of("foobar")
        );
        assert_eq!(blob.media_type().as_deref(), Some("application/x-thing"));
        assert!(
            registry
                .blob(&json!({"type": "binary", "data": "!!"}))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_file_input_with_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "content").unwrap();
        let registry = InputMethodRegistry::new().with_working_directory(dir.path());
        let blob = registry
            .blob(&json!({"type": "file", "path": "data.txt"}))
            .await
            .unwrap();
        let mut out = Vec::new();
        blob.open_reader().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"content");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = InputMethodRegistry::new();
        assert!(matches!(
            registry.blob(&json!({"type": "teleport"})).await,
            Err(Error::UnknownMethod(_))
        ));
    }
}
