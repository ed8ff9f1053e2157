//! The `(hash, size)` content identifier.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifies a blob or directory record by the hash of its bytes and their length.
///
/// Two digests are equal only when both the hash string and the size match.
/// The invariant `hash == H(content)` and `size_bytes == len(content)` is
/// trusted when a digest is received from elsewhere; it is not re-checked
/// here.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex encoding of the content hash.
    pub hash: String,
    /// Length of the content in bytes.
    pub size_bytes: u64,
}

/// Serialized bytes of newly created objects, keyed by their digest.
pub type DigestBlobMap = HashMap<Digest, Vec<u8>>;

impl Digest {
    /// Create a digest from a hash string and a size.
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// Create a digest from raw hash bytes.
    pub fn from_raw(hash: &[u8], size_bytes: u64) -> Self {
        Self::new(hex::encode(hash), size_bytes)
    }

    /// Parse the `<hash>/<size>` form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_digest(format!("Expected <hash>/<size>, got {s}")))?;

        Self::validate_hash(hash)?;

        let size_bytes = size
            .parse::<u64>()
            .map_err(|e| Error::invalid_digest(format!("Invalid size {size:?}: {e}")))?;

        Ok(Self::new(hash, size_bytes))
    }

    /// Check that a hash string is non-empty lowercase hex.
    pub fn validate_hash(hash: &str) -> Result<()> {
        if hash.is_empty() {
            return Err(Error::invalid_digest("Hash cannot be empty"));
        }
        if !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::invalid_digest(format!(
                "Hash must be lowercase hex: {hash}"
            )));
        }
        Ok(())
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        let prefix: String = self.hash.chars().take(12).collect();
        format!("{prefix}/{}", self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}/{})", self.hash, self.size_bytes)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
