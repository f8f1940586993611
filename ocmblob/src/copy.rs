use std::io::{Read, Write};

use ocmmodel::digest::Hasher;

use crate::{Blob, Error};

// same buffer size the registry client uses when streaming layers
pub(crate) const COPY_BUF_SIZE: usize = 128 * 1024;

/// Copy the blob's content into `dst`.
///
/// When the source knows its size, exactly that many bytes are copied and a
/// short or long stream is a size mismatch. When the source carries a digest,
/// the stream is teed through a verifier and a mismatch fails the copy with
/// a digest verification error. The source reader is dropped on every exit
/// path.
pub fn copy<W: Write>(dst: &mut W, src: &dyn Blob) -> Result<u64, Error> {
    copy_buffered(dst, src, COPY_BUF_SIZE)
}

pub fn copy_buffered<W: Write>(dst: &mut W, src: &dyn Blob, buf_size: usize) -> Result<u64, Error> {
    let mut reader = src.open_reader()?;
    let expected_size = src.size();
    let expected_digest = src.digest();

    let mut hasher = expected_digest
        .as_ref()
        .map(|d| Hasher::new(d.algorithm()));

    let mut buf = vec![0u8; std::cmp::max(1, buf_size)];
    let mut copied: u64 = 0;
    loop {
        // with a known size never read past it, so appended junk is not
        // silently included
        let want = match expected_size {
            Some(size) => {
                let remaining = size.saturating_sub(copied);
                if remaining == 0 {
                    break;
                }
                std::cmp::min(remaining, buf.len() as u64) as usize
            }
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..n]);
        }
        dst.write_all(&buf[..n])?;
        copied += n as u64;
    }
    drop(reader);
    dst.flush()?;

    if let Some(size) = expected_size
        && copied != size
    {
        return Err(Error::SizeMismatch {
            expected: size,
            got: copied,
        });
    }
    if let (Some(expected), Some(hasher)) = (expected_digest, hasher) {
        let got = hasher.finalize();
        if got != expected {
            return Err(Error::DigestVerificationFailed { expected, got });
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlob;
    use crate::{DigestAware, DigestPrecalculatable, ReadOnlyBlob};
    use ocmmodel::digest::Digest;

    #[test]
    fn test_roundtrip() {
        let src = MemoryBlob::from_bytes("some blob content");
        let mut out = Vec::new();
        let n = copy(&mut out, &src).unwrap();
        assert_eq!(n, 17);
        assert_eq!(out, b"some blob content");
        // digest unchanged by the copy
        assert_eq!(src.digest(), Some(Digest::sha256_of("some blob content")));
    }

    #[test]
    fn test_digest_verification_failure() {
        let src = MemoryBlob::from_bytes("bar");
        src.set_precalculated_digest(Digest::sha256_of("foo"));
        let mut out = Vec::new();
        let err = copy(&mut out, &src).unwrap_err();
        assert!(err.to_string().contains("digest verification failed"));
    }

    #[test]
    fn test_known_size_bounds_the_copy() {
        // a blob that grows between size query and read still copies only
        // the promised size... easiest to exercise via a small buffer
        let src = MemoryBlob::from_bytes(vec![7u8; 1000]);
        let mut out = Vec::new();
        let n = copy_buffered(&mut out, &src, 16).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(out.len(), 1000);
    }

    #[test]
    fn test_copy_then_read_back() {
        let src = MemoryBlob::from_bytes("roundtrip");
        let dst = MemoryBlob::new();
        {
            let mut w = crate::WriteableBlob::open_writer(&dst).unwrap();
            copy(&mut w, &src).unwrap();
        }
        let mut direct = Vec::new();
        src.open_reader().unwrap().read_to_end(&mut direct).unwrap();
        let mut through = Vec::new();
        dst.open_reader().unwrap().read_to_end(&mut through).unwrap();
        assert_eq!(direct, through);
    }
}
