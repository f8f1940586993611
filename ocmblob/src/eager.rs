use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use ocmmodel::digest::Digest;

use crate::{
    DEFAULT_MEDIA_TYPE, DigestAware, DigestPrecalculatable, Error, MediaTypeAware,
    MediaTypeOverrideable, ReadOnlyBlob, SizeAware, SizePrecalculatable,
};

/// Wraps an arbitrary stream and materializes the full content to memory on
/// first demand (read, size or digest query, or an explicit [EagerBlob::load]).
/// After that the size is exact and the digest is the sha-256 of the full
/// content. If a digest was asserted up front and the content does not match,
/// the digest is reported as unknown and every later open fails with the
/// mismatch. A partially-read and dropped reader can never pollute the
/// digest, since digesting always happens over the buffered full content.
pub struct EagerBlob {
    state: Mutex<State>,
}

enum State {
    Pending {
        reader: Option<Box<dyn Read + Send>>,
        precalculated: Option<Digest>,
        media_type: Option<String>,
    },
    Loaded {
        data: Arc<Vec<u8>>,
        digest: Option<Digest>,
        mismatch: Option<Box<Error>>,
        media_type: Option<String>,
    },
}

impl EagerBlob {
    pub fn new(reader: impl Read + Send + 'static) -> EagerBlob {
        EagerBlob {
            state: Mutex::new(State::Pending {
                reader: Some(Box::new(reader)),
                precalculated: None,
                media_type: None,
            }),
        }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> EagerBlob {
        let data: Vec<u8> = data.into();
        let digest = Digest::sha256_of(&data);
        EagerBlob {
            state: Mutex::new(State::Loaded {
                data: Arc::new(data),
                digest: Some(digest),
                mismatch: None,
                media_type: None,
            }),
        }
    }

    /// Force materialization now instead of at first use.
    pub fn load(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        self.load_locked(&mut state)
    }

    fn load_locked(&self, state: &mut State) -> Result<(), Error> {
        if let State::Pending {
            reader,
            precalculated,
            media_type,
        } = state
        {
            let mut data = Vec::new();
            match reader.take() {
                Some(mut r) => {
                    r.read_to_end(&mut data)?;
                }
                // a previous load attempt already consumed the reader
                None => return Err(Error::UnexpectedEof),
            }
            let computed = Digest::sha256_of(&data);
            let (digest, mismatch) = match precalculated.take() {
                Some(expected) if expected != computed => (
                    None,
                    Some(Box::new(Error::DigestVerificationFailed {
                        expected,
                        got: computed,
                    })),
                ),
                Some(expected) => (Some(expected), None),
                None => (Some(computed), None),
            };
            *state = State::Loaded {
                data: Arc::new(data),
                digest,
                mismatch,
                media_type: media_type.take(),
            };
        }
        Ok(())
    }

    fn mismatch_error(mismatch: &Error) -> Error {
        match mismatch {
            Error::DigestVerificationFailed { expected, got } => {
                Error::DigestVerificationFailed {
                    expected: expected.clone(),
                    got: got.clone(),
                }
            }
            _ => Error::UnexpectedEof,
        }
    }
}

impl ReadOnlyBlob for EagerBlob {
    fn open_reader(&self) -> Result<Box<dyn Read + Send>, Error> {
        let mut state = self.state.lock().unwrap();
        self.load_locked(&mut state)?;
        match &*state {
            State::Loaded {
                mismatch: Some(e), ..
            } => Err(Self::mismatch_error(e)),
            State::Loaded { data, .. } => Ok(Box::new(EagerReader {
                data: data.clone(),
                pos: 0,
            })),
            State::Pending { .. } => unreachable!("loaded above"),
        }
    }
}

impl SizeAware for EagerBlob {
    fn size(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if self.load_locked(&mut state).is_err() {
            return None;
        }
        match &*state {
            State::Loaded { data, .. } => Some(data.len() as u64),
            State::Pending { .. } => None,
        }
    }
}

impl DigestAware for EagerBlob {
    fn digest(&self) -> Option<Digest> {
        let mut state = self.state.lock().unwrap();
        if self.load_locked(&mut state).is_err() {
            return None;
        }
        match &*state {
            State::Loaded { digest, .. } => digest.clone(),
            State::Pending { .. } => None,
        }
    }
}

impl MediaTypeAware for EagerBlob {
    fn media_type(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        let mt = match &*state {
            State::Pending { media_type, .. } => media_type.clone(),
            State::Loaded { media_type, .. } => media_type.clone(),
        };
        Some(mt.unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string()))
    }
}

impl SizePrecalculatable for EagerBlob {
    fn set_precalculated_size(&self, _size: u64) {
        // the buffer is authoritative once loaded; nothing useful to record
    }
}

impl DigestPrecalculatable for EagerBlob {
    fn set_precalculated_digest(&self, digest: Digest) {
        let mut state = self.state.lock().unwrap();
        if let State::Pending { precalculated, .. } = &mut *state {
            *precalculated = Some(digest);
        }
    }
}

impl MediaTypeOverrideable for EagerBlob {
    fn set_media_type(&self, new: &str) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Pending { media_type, .. } | State::Loaded { media_type, .. } => {
                *media_type = Some(new.to_string())
            }
        }
    }
}

/// Restartable, seekable view over the buffered content. Seeking out of
/// range (past the end, or to a negative position) fails with an
/// end-of-stream error rather than clamping.
pub struct EagerReader {
    data: Arc<Vec<u8>>,
    pos: u64,
}

impl Read for EagerReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.data.as_slice();
        let pos = self.pos.min(data.len() as u64) as usize;
        let n = std::cmp::min(buf.len(), data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for EagerReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.data.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if target < 0 || target > len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "seek out of range",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
