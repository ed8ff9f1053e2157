//! On-disk object format of the local store.
//!
//! Objects are stored with a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "CSTG" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   hash function: 1=sha256, 2=sha1, 3=blake3
//! 0x06  1   compression: 0=none, 1=zstd
//! 0x07  1   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored (possibly compressed) size
//! 0x10  ... payload
//! ```

use crate::error::{Error, Result};
use crate::hash::HashFunction;
use std::path::Path;

/// Magic bytes at the start of every object file.
pub const MAGIC: &[u8; 4] = b"CSTG";

/// Current object format version.
pub const VERSION: u8 = 1;

/// Size of the object header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

fn function_id(function: HashFunction) -> u8 {
    match function {
        HashFunction::Sha256 => 1,
        HashFunction::Sha1 => 2,
        HashFunction::Blake3 => 3,
    }
}

fn function_from_id(id: u8) -> Option<HashFunction> {
    match id {
        1 => Some(HashFunction::Sha256),
        2 => Some(HashFunction::Sha1),
        3 => Some(HashFunction::Blake3),
        _ => None,
    }
}

/// A 16-byte object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub function: HashFunction,
    pub compression: CompressionType,
    /// Length of the stored payload in bytes (compressed size if compressed).
    pub payload_len: u64,
}

impl ObjectHeader {
    pub fn new(function: HashFunction, compression: CompressionType, payload_len: u64) -> Self {
        Self {
            function,
            compression,
            payload_len,
        }
    }

    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = function_id(self.function);
        buf[6] = self.compression.to_u8();
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header read from the object at `path`.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted_object(
                path,
                format!("Header too short: {} bytes", buf.len()),
            ));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::corrupted_object(
                path,
                format!("Invalid magic: {:?}", &buf[0..4]),
            ));
        }

        if buf[4] != VERSION {
            return Err(Error::corrupted_object(
                path,
                format!("Unsupported version: {}", buf[4]),
            ));
        }

        let function = function_from_id(buf[5]).ok_or_else(|| {
            Error::corrupted_object(path, format!("Unknown hash function id: {}", buf[5]))
        })?;

        let compression = CompressionType::from_u8(buf[6]).ok_or_else(|| {
            Error::corrupted_object(path, format!("Unknown compression: {}", buf[6]))
        })?;

        if buf[7] != 0 {
            return Err(Error::corrupted_object(
                path,
                format!("Reserved byte must be 0, got {}", buf[7]),
            ));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);

        Ok(Self {
            function,
            compression,
            payload_len: u64::from_le_bytes(len_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = ObjectHeader::new(HashFunction::Blake3, CompressionType::Zstd, 1234);
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], MAGIC);

        let decoded = ObjectHeader::decode(&encoded, Path::new("obj")).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut encoded = ObjectHeader::new(HashFunction::Sha256, CompressionType::None, 1).encode();
        encoded[0] = b'X';
        assert!(matches!(
            ObjectHeader::decode(&encoded, Path::new("obj")),
            Err(Error::CorruptedObject { .. })
        ));
    }

    #[test]
    fn test_header_rejects_short_and_reserved() {
        assert!(ObjectHeader::decode(&[0u8; 4], Path::new("obj")).is_err());

        let mut encoded = ObjectHeader::new(HashFunction::Sha1, CompressionType::None, 1).encode();
        encoded[7] = 1;
        assert!(ObjectHeader::decode(&encoded, Path::new("obj")).is_err());
    }
}
