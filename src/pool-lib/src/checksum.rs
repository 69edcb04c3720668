use crate::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumType {
    Sha256,
    Sha512,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Sha256 => "SHA-256",
            ChecksumType::Sha512 => "SHA-512",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SHA-256" | "SHA256" => Some(ChecksumType::Sha256),
            "SHA-512" | "SHA512" => Some(ChecksumType::Sha512),
            _ => None,
        }
    }

    pub fn create_hasher(&self) -> ChecksumHasher {
        match self {
            ChecksumType::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
            ChecksumType::Sha512 => ChecksumHasher::Sha512(Sha512::new()),
        }
    }
}

/// A checksum value in lower case hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub kind: ChecksumType,
    pub value: String,
}

impl Checksum {
    pub fn new(kind: ChecksumType, value: &str) -> PoolResult<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| PoolError::InvalidParam(format!("invalid checksum {}: {}", value, e)))?;
        let expected = match kind {
            ChecksumType::Sha256 => 32,
            ChecksumType::Sha512 => 64,
        };
        if bytes.len() != expected {
            return Err(PoolError::InvalidParam(format!(
                "invalid {} checksum length: {}",
                kind.as_str(),
                value
            )));
        }
        Ok(Self {
            kind,
            value: hex::encode(bytes),
        })
    }

    pub fn calculate(kind: ChecksumType, data: &[u8]) -> Self {
        let mut hasher = kind.create_hasher();
        hasher.update(data);
        hasher.finish()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.value)
    }
}

/// Streaming digest, fed while bytes are copied into a replica.
pub enum ChecksumHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Sha256(h) => h.update(data),
            ChecksumHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Checksum {
        match self {
            ChecksumHasher::Sha256(h) => Checksum {
                kind: ChecksumType::Sha256,
                value: hex::encode(h.finalize()),
            },
            ChecksumHasher::Sha512(h) => Checksum {
                kind: ChecksumType::Sha512,
                value: hex::encode(h.finalize()),
            },
        }
    }
}

/// Compares `actual` against the known checksums of the same type.
/// Checksums of other types are ignored.
pub fn verify_checksum(known: &[Checksum], actual: &Checksum) -> PoolResult<()> {
    for expected in known.iter().filter(|c| c.kind == actual.kind) {
        if expected.value != actual.value {
            return Err(PoolError::ChecksumMismatch(format!(
                "expected {} but got {}",
                expected, actual
            )));
        }
    }
    Ok(())
}
