//! SHA256 content digests
//!
//! A [`Digest`] is the `sha256:<hex>` identifier registries use for blobs and manifests.
//! Parsing validates the algorithm and hex length so the rest of the crate can treat a
//! `Digest` as known-good.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

pub const SHA256_PREFIX: &str = "sha256:";

/// Digest of an empty byte sequence
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the sha256 digest of `data`
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
    }

    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        let hex_part = value.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
            RegistryError::Parse(format!("unsupported digest algorithm: {}", value))
        })?;
        if !is_valid_sha256_hex(hex_part) {
            return Err(RegistryError::Parse(format!("invalid sha256 digest: {}", value)));
        }
        Ok(Digest(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex portion without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(19)]
    }

    /// Verify that `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> Result<(), RegistryError> {
        let actual = Digest::from_bytes(data);
        if &actual != self {
            return Err(RegistryError::DigestMismatch {
                expected: self.0.clone(),
                actual: actual.0,
            });
        }
        Ok(())
    }
}

pub fn is_valid_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}
