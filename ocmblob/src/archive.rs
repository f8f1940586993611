use std::io::{Read, Write};

use ocmmodel::digest::Digest;

use crate::{Blob, Error, copy::COPY_BUF_SIZE};

/// Append the blob as one tar entry named `name` with mode 0644 and exactly
/// `size` bytes. Errors are wrapped with the blob's digest so a failing
/// entry inside a large archive can be pinned down.
pub fn archive_blob<W: Write>(
    name: &str,
    size: u64,
    digest: &Digest,
    blob: &dyn Blob,
    writer: &mut tar::Builder<W>,
    buf_size: Option<usize>,
) -> Result<(), Error> {
    archive_blob_inner(name, size, blob, writer, buf_size.unwrap_or(COPY_BUF_SIZE)).map_err(|e| {
        Error::Archive {
            digest: digest.clone(),
            source: Box::new(e),
        }
    })
}

fn archive_blob_inner<W: Write>(
    name: &str,
    size: u64,
    blob: &dyn Blob,
    writer: &mut tar::Builder<W>,
    buf_size: usize,
) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(size);
    header.set_cksum();

    let reader = blob.open_reader()?;
    // cap the stream at the declared size and count what actually flowed, so
    // a short or grown blob surfaces as a size mismatch
    let mut limited = CountingReader {
        inner: reader.take(size),
        read: 0,
    };
    writer.append_data(&mut header, name, std::io::BufReader::with_capacity(buf_size, &mut limited))?;
    if limited.read != size {
        return Err(Error::SizeMismatch {
            expected: size,
            got: limited.read,
        });
    }
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    read: u64,
}

impl<R: std::io::Read> std::io::Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}
