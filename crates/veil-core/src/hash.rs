//! Content hashing: the global content identifier.
//!
//! A `ContentHash` is the BLAKE3 digest of a byte stream. It is the only key
//! used to name, deduplicate, and verify content on the overlay. Large inputs
//! are hashed incrementally through `ContentHasher` so they never have to be
//! held in memory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Digest length in bytes.
pub const HASH_LEN: usize = 32;

/// BLAKE3 hash of a byte slice.
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Fixed-length identifier computed from content bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; HASH_LEN]);

impl ContentHash {
    /// Hash a complete in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let bytes = hex::decode(s.trim()).map_err(|_| HashParseError::NotHex)?;
        if bytes.len() != HASH_LEN {
            return Err(HashParseError::WrongLength(bytes.len()));
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl FromStr for ContentHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
    #[error("content hash is not valid hex")]
    NotHex,
    #[error("content hash has {0} bytes, expected {HASH_LEN}")]
    WrongLength(usize),
}

/// Incremental hasher. Feed it slices as they are read from disk or the
/// network, then call `finalize`.
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash(*self.inner.finalize().as_bytes())
    }
}
