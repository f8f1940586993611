use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    MissingSeparator,
    UnhandledAlgorithm(String),
    BadHexLength { expected: usize, got: usize },
    NotLowerHex,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    // length of the lower hex encoding, not the raw bytes
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::UnhandledAlgorithm(other.to_string())),
        }
    }
}

/// Canonical content digest in `algo:hex` form. The hex part is validated to
/// be lowercase and of the exact length for the algorithm, so two digests of
/// the same content always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn new(algorithm: Algorithm, hex: String) -> Result<Self, Error> {
        if hex.len() != algorithm.hex_len() {
            return Err(Error::BadHexLength {
                expected: algorithm.hex_len(),
                got: hex.len(),
            });
        }
        if !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::NotLowerHex);
        }
        Ok(Self { algorithm, hex })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn sha256_of(data: impl AsRef<[u8]>) -> Digest {
        Digest {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn sha512_of(data: impl AsRef<[u8]>) -> Digest {
        Digest {
            algorithm: Algorithm::Sha512,
            hex: hex::encode(Sha512::digest(data)),
        }
    }

    // sha256:foo -> sha256/foo, the oci blob directory layout
    pub fn as_path(&self) -> String {
        format!("{}/{}", self.algorithm, self.hex)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        let (algo, hex) = s.split_once(':').ok_or(Error::MissingSeparator)?;
        Digest::new(algo.parse()?, hex.to_string())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [Digest]. Polymorphic over the algorithm so
/// verification code does not have to branch at every update.
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: Algorithm) -> Hasher {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Hasher::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of() {
        assert_eq!(
            Digest::sha256_of("foobar").to_string(),
            "sha256:c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2"
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let s = "sha256:c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2";
        let d: Digest = s.parse().unwrap();
        assert_eq!(d.to_string(), s);
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(d.as_path().split('/').next().unwrap(), "sha256");
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(
            "md5:abcd".parse::<Digest>(),
            Err(Error::UnhandledAlgorithm("md5".to_string()))
        );
        assert!(matches!(
            "sha256:abcd".parse::<Digest>(),
            Err(Error::BadHexLength { .. })
        ));
        // uppercase hex is not canonical
        let upper = "sha256:C3AB8FF13720E8AD9047DD39466B3C8974E592C2FA383D4A3960714CAEF0C4F2";
        assert_eq!(upper.parse::<Digest>(), Err(Error::NotLowerHex));
        assert_eq!("sha256".parse::<Digest>(), Err(Error::MissingSeparator));
    }

    #[test]
    fn test_hasher_incremental() {
        let mut h = Hasher::new(Algorithm::Sha256);
        h.update("foo");
        h.update("bar");
        assert_eq!(h.finalize(), Digest::sha256_of("foobar"));
    }
}
