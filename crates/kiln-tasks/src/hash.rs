//! SHA-256 digests used for fingerprints, identities and cache keys

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Hex-encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest of a byte slice
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.put_bytes(bytes);
        hasher.finish()
    }

    /// Digest everything readable from `reader`
    pub fn of_reader<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        let mut sha = Sha256::new();
        io::copy(reader, &mut sha)?;
        Ok(Self(format!("{:x}", sha.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log output
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher with length-prefixed fields.
///
/// Every value is prefixed with its length so that `("ab", "c")` and
/// `("a", "bc")` never produce the same digest.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub fn put_digest(&mut self, digest: &Digest) {
        self.put_str(digest.as_str());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.inner.update([value as u8]);
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{:x}", self.inner.finalize()))
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
