use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use ocmmodel::digest::Digest;

use crate::{
    DigestAware, DigestPrecalculatable, Error, MediaTypeAware, MediaTypeOverrideable,
    ReadOnlyBlob, SizeAware, SizePrecalculatable, WriteableBlob,
};

/// Path-backed blob. Every reader is an independent `File`; writers open the
/// file in append mode so successive writers extend the content. Size comes
/// from the filesystem; the digest is only known when asserted (verification
/// happens wherever the blob is consumed).
pub struct FileBlob {
    path: PathBuf,
    meta: Mutex<Meta>,
}

#[derive(Default)]
struct Meta {
    digest: Option<Digest>,
    size_hint: Option<u64>,
    media_type: Option<String>,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> FileBlob {
        FileBlob {
            path: path.into(),
            meta: Mutex::new(Meta::default()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ReadOnlyBlob for FileBlob {
    fn open_reader(&self) -> Result<Box<dyn Read + Send>, Error> {
        let file = File::open(&self.path)?;
        Ok(Box::new(file))
    }
}

impl WriteableBlob for FileBlob {
    fn open_writer(&self) -> Result<Box<dyn Write + Send>, Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(Box::new(file))
    }
}

impl SizeAware for FileBlob {
    fn size(&self) -> Option<u64> {
        let meta = self.meta.lock().unwrap();
        let on_disk = std::fs::metadata(&self.path).map(|m| m.len()).ok();
        match (on_disk, meta.size_hint) {
            (Some(a), Some(b)) => Some(std::cmp::max(a, b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

impl DigestAware for FileBlob {
    fn digest(&self) -> Option<Digest> {
        self.meta.lock().unwrap().digest.clone()
    }
}

impl MediaTypeAware for FileBlob {
    fn media_type(&self) -> Option<String> {
        self.meta.lock().unwrap().media_type.clone()
    }
}

impl SizePrecalculatable for FileBlob {
    fn set_precalculated_size(&self, size: u64) {
        let mut meta = self.meta.lock().unwrap();
        let current = std::cmp::max(
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            meta.size_hint.unwrap_or(0),
        );
        if size > current {
            meta.size_hint = Some(size);
        }
    }
}

impl DigestPrecalculatable for FileBlob {
    fn set_precalculated_digest(&self, digest: Digest) {
        self.meta.lock().unwrap().digest = Some(digest);
    }
}

impl MediaTypeOverrideable for FileBlob {
    fn set_media_type(&self, media_type: &str) {
        self.meta.lock().unwrap().media_type = Some(media_type.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let blob = FileBlob::new(dir.path().join("data"));
        blob.open_writer().unwrap().write_all(b"foo").unwrap();
        blob.open_writer().unwrap().write_all(b"bar").unwrap();
        let mut out = String::new();
        blob.open_reader().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "foobar");
        assert_eq!(blob.size(), Some(6));
    }

    #[test]
    fn test_missing_file() {
        let blob = FileBlob::new("/definitely/not/here");
        assert!(blob.open_reader().is_err());
        assert_eq!(blob.size(), None);
    }
}
