//! Subresource-integrity strings as published by npm registries.
//!
//! `dist.integrity` is `<algo>-<base64 digest>`, possibly several
//! whitespace-separated. Older packages only carry `dist.shasum`, a hex
//! SHA-1.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hyperpm_util::hash::hex_encode;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// Supported digest algorithms, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

/// One expected digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Integrity {
    algorithm: HashAlgorithm,
    digest: Vec<u8>,
}

impl Integrity {
    /// Parse an SRI string, keeping the strongest supported hash.
    ///
    /// Unknown algorithms and malformed entries are ignored; `None` if no
    /// entry is usable.
    #[must_use]
    pub fn parse(sri: &str) -> Option<Self> {
        sri.split_whitespace()
            .filter_map(|entry| {
                let (algo, rest) = entry.split_once('-')?;
                let algorithm = HashAlgorithm::from_name(algo)?;
                // Drop SRI options ("?foo")
                let b64 = rest.split('?').next().unwrap_or(rest);
                let digest = STANDARD.decode(b64).ok()?;
                (digest.len() == algorithm.digest_len()).then_some(Self { algorithm, digest })
            })
            .max_by_key(|i| i.algorithm)
    }

    /// Build from a legacy `shasum` (hex SHA-1).
    #[must_use]
    pub fn from_sha1_hex(hex: &str) -> Option<Self> {
        let digest = hex_decode(hex.trim())?;
        (digest.len() == HashAlgorithm::Sha1.digest_len()).then_some(Self {
            algorithm: HashAlgorithm::Sha1,
            digest,
        })
    }

    /// Hash `data` with `algorithm`.
    #[must_use]
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let digest = match algorithm {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        };
        Self { algorithm, digest }
    }

    /// Check `data` against this digest.
    ///
    /// # Errors
    /// Returns the actual digest of `data` on mismatch.
    pub fn verify(&self, data: &[u8]) -> Result<(), Integrity> {
        let actual = Self::compute(self.algorithm, data);
        if actual == *self {
            Ok(())
        } else {
            Err(actual)
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Content-addressed store key: the hex digest.
    #[must_use]
    pub fn key(&self) -> String {
        hex_encode(&self.digest)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.as_str(), STANDARD.encode(&self.digest))
    }
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_display() {
        let integrity = Integrity::compute(HashAlgorithm::Sha512, b"hello");
        let parsed = Integrity::parse(&integrity.to_string()).unwrap();
        assert_eq!(parsed, integrity);
        assert!(integrity.to_string().starts_with("sha512-"));
    }

    #[test]
    fn test_verify() {
        let integrity = Integrity::compute(HashAlgorithm::Sha512, b"package bytes");
        assert!(integrity.verify(b"package bytes").is_ok());

        let actual = integrity.verify(b"tampered").unwrap_err();
        assert_eq!(actual, Integrity::compute(HashAlgorithm::Sha512, b"tampered"));
    }

    #[test]
    fn test_strongest_hash_wins() {
        let sha1 = Integrity::compute(HashAlgorithm::Sha1, b"x");
        let sha512 = Integrity::compute(HashAlgorithm::Sha512, b"x");
        let parsed = Integrity::parse(&format!("{sha1} {sha512}")).unwrap();
        assert_eq!(parsed.algorithm(), HashAlgorithm::Sha512);
    }

    #[test]
    fn test_unknown_and_malformed_ignored() {
        assert!(Integrity::parse("md5-abc").is_none());
        assert!(Integrity::parse("sha512-not!base64").is_none());
        assert!(Integrity::parse("sha512-aGVsbG8=").is_none()); // wrong length
        assert!(Integrity::parse("").is_none());

        let sha256 = Integrity::compute(HashAlgorithm::Sha256, b"y");
        let parsed = Integrity::parse(&format!("md5-abc {sha256}?opt")).unwrap();
        assert_eq!(parsed, sha256);
    }

    #[test]
    fn test_legacy_shasum() {
        // sha1("hello world")
        let integrity =
            Integrity::from_sha1_hex("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed").unwrap();
        assert!(integrity.verify(b"hello world").is_ok());
        assert_eq!(integrity.key(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");

        assert!(Integrity::from_sha1_hex("zz").is_none());
        assert!(Integrity::from_sha1_hex("abc").is_none());
    }

    #[test]
    fn test_key_is_hex_digest() {
        let integrity = Integrity::compute(HashAlgorithm::Sha256, b"");
        assert_eq!(
            integrity.key(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
