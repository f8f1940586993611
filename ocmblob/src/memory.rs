use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use ocmmodel::digest::Digest;

use crate::{
    DEFAULT_MEDIA_TYPE, DigestAware, DigestPrecalculatable, Error, MediaTypeAware,
    MediaTypeOverrideable, ReadOnlyBlob, SizeAware, SizePrecalculatable, WriteableBlob,
};

// Clone + interior mutability so that readers and writers can outlive the
// handle they were opened from; same shape as the shared clients elsewhere.
#[derive(Clone, Default)]
pub struct MemoryBlob {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    data: Arc<Vec<u8>>,
    // computed lazily from data, cleared on every write
    computed: Option<Digest>,
    precalculated: Option<Digest>,
    size_hint: Option<u64>,
    media_type: Option<String>,
}

impl MemoryBlob {
    pub fn new() -> MemoryBlob {
        MemoryBlob::default()
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> MemoryBlob {
        MemoryBlob {
            inner: Arc::new(Mutex::new(Inner {
                data: Arc::new(data.into()),
                ..Inner::default()
            })),
        }
    }

    pub fn with_media_type(self, media_type: impl Into<String>) -> MemoryBlob {
        self.inner.lock().unwrap().media_type = Some(media_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadOnlyBlob for MemoryBlob {
    fn open_reader(&self) -> Result<Box<dyn Read + Send>, Error> {
        // snapshot; concurrent writers don't affect an open reader
        let data = self.inner.lock().unwrap().data.clone();
        Ok(Box::new(Cursor::new(SharedBytes(data))))
    }
}

impl WriteableBlob for MemoryBlob {
    fn open_writer(&self) -> Result<Box<dyn Write + Send>, Error> {
        Ok(Box::new(MemoryWriter {
            inner: self.inner.clone(),
        }))
    }
}

impl SizeAware for MemoryBlob {
    fn size(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        let len = inner.data.len() as u64;
        Some(std::cmp::max(len, inner.size_hint.unwrap_or(0)))
    }
}

impl DigestAware for MemoryBlob {
    fn digest(&self) -> Option<Digest> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = &inner.precalculated {
            return Some(d.clone());
        }
        if inner.computed.is_none() {
            inner.computed = Some(Digest::sha256_of(inner.data.as_slice()));
        }
        inner.computed.clone()
    }
}

impl MediaTypeAware for MemoryBlob {
    fn media_type(&self) -> Option<String> {
        Some(
            self.inner
                .lock()
                .unwrap()
                .media_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string()),
        )
    }
}

impl SizePrecalculatable for MemoryBlob {
    fn set_precalculated_size(&self, size: u64) {
        let mut inner = self.inner.lock().unwrap();
        let current = std::cmp::max(inner.data.len() as u64, inner.size_hint.unwrap_or(0));
        if size > current {
            inner.size_hint = Some(size);
        }
    }
}

impl DigestPrecalculatable for MemoryBlob {
    fn set_precalculated_digest(&self, digest: Digest) {
        self.inner.lock().unwrap().precalculated = Some(digest);
    }
}

impl MediaTypeOverrideable for MemoryBlob {
    fn set_media_type(&self, media_type: &str) {
        self.inner.lock().unwrap().media_type = Some(media_type.to_string());
    }
}

// Cursor needs AsRef<[u8]>
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<Inner>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        Arc::make_mut(&mut inner.data).extend_from_slice(buf);
        inner.computed = None;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
