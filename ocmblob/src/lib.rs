//! Streaming blob substrate: capability traits over arbitrary byte content,
//! eager buffering for content whose size/digest is unknown up front, a
//! digest-verifying copy, and tar archiving.

use std::io::{Read, Write};

use ocmmodel::digest::Digest;

pub mod archive;
pub mod copy;
pub mod eager;
pub mod file;
pub mod memory;

pub use archive::archive_blob;
pub use copy::{copy, copy_buffered};
pub use eager::EagerBlob;
pub use file::FileBlob;
pub use memory::MemoryBlob;

pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    DigestVerificationFailed { expected: Digest, got: Digest },
    SizeMismatch { expected: u64, got: u64 },
    UnexpectedEof,
    ReadOnly,
    Archive { digest: Digest, source: Box<Error> },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::DigestVerificationFailed { expected, got } => {
                write!(f, "digest verification failed: expected {expected}, got {got}")
            }
            Error::Archive { digest, source } => {
                write!(f, "archiving blob {digest}: {source}")
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// Readable content. `open_reader` must be safe to call concurrently and
/// every call yields an independent stream positioned at byte 0.
pub trait ReadOnlyBlob {
    fn open_reader(&self) -> Result<Box<dyn Read + Send>, Error>;
}

/// Writable content. Successive writers append to what previous writers
/// wrote.
pub trait WriteableBlob {
    fn open_writer(&self) -> Result<Box<dyn Write + Send>, Error>;
}

/// `None` means the size is not (yet) known.
pub trait SizeAware {
    fn size(&self) -> Option<u64> {
        None
    }
}

/// `None` means no digest is known. A returned digest is either computed
/// from the full content or asserted by the producer (and then verified on
/// the next full read).
pub trait DigestAware {
    fn digest(&self) -> Option<Digest> {
        None
    }
}

pub trait MediaTypeAware {
    fn media_type(&self) -> Option<String> {
        None
    }
}

/// Assert a size before the content has been read. Sizes only grow toward
/// the true size: a value smaller than what is already known is ignored.
pub trait SizePrecalculatable {
    fn set_precalculated_size(&self, size: u64);
}

/// Assert a digest before the content has been read. It is verified against
/// the computed digest on the next full read.
pub trait DigestPrecalculatable {
    fn set_precalculated_digest(&self, digest: Digest);
}

pub trait MediaTypeOverrideable {
    fn set_media_type(&self, media_type: &str);
}

/// The full-awareness bundle most call sites want. Blanket-implemented, so
/// any type carrying the four capabilities is a [Blob].
pub trait Blob: ReadOnlyBlob + SizeAware + DigestAware + MediaTypeAware + Send + Sync {}

impl<T: ReadOnlyBlob + SizeAware + DigestAware + MediaTypeAware + Send + Sync> Blob for T {}
