//! Digest generation over memory buffers, files and incremental streams.

use crate::digest::Digest;
use crate::directory::Directory;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Read buffer size used when hashing files and readers (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Supported digest functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    /// SHA-256. Always supported, and the default for compatibility.
    #[default]
    Sha256,
    /// SHA-1.
    Sha1,
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl HashFunction {
    /// Every function this build can compute.
    pub fn supported() -> &'static [HashFunction] {
        &[HashFunction::Sha256, HashFunction::Sha1, HashFunction::Blake3]
    }

    /// Returns the string representation of the function (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            HashFunction::Sha256 => "sha256",
            HashFunction::Sha1 => "sha1",
            HashFunction::Blake3 => "blake3",
        }
    }

    /// Parse a function from its name.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashFunction::Sha256),
            "sha1" | "sha-1" => Ok(HashFunction::Sha1),
            "blake3" => Ok(HashFunction::Blake3),
            _ => Err(Error::unsupported_hash_function(s)),
        }
    }

    /// Length of the lowercase hex hash this function produces.
    pub fn hex_len(&self) -> usize {
        match self {
            HashFunction::Sha256 | HashFunction::Blake3 => 64,
            HashFunction::Sha1 => 40,
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes digests with one configured hash function.
///
/// The function is plain data held by the generator, so two generators with
/// different functions can be used side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigestGenerator {
    function: HashFunction,
}

impl DigestGenerator {
    /// Create a generator for the given function.
    pub fn new(function: HashFunction) -> Self {
        Self { function }
    }

    /// The function this generator hashes with.
    pub fn function(&self) -> HashFunction {
        self.function
    }

    /// Start an incremental hashing context.
    pub fn context(&self) -> HashingContext {
        HashingContext::new(self.function)
    }

    /// Digest an in-memory buffer in one pass.
    pub fn hash_bytes(&self, data: &[u8]) -> Digest {
        let mut ctx = self.context();
        ctx.update(data);
        ctx.finalize()
    }

    /// Digest the whole content of a seekable source.
    ///
    /// Seeks to offset 0 first, then streams fixed-size chunks, so the
    /// descriptor's position is changed as a side effect.
    pub fn hash_file<F: Read + Seek>(&self, file: &mut F) -> Result<Digest> {
        file.seek(SeekFrom::Start(0))?;
        self.hash_reader(file)
    }

    /// Digest everything remaining in a reader.
    pub fn hash_reader<R: Read>(&self, mut reader: R) -> Result<Digest> {
        let mut ctx = self.context();
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            ctx.update(&buf[..n]);
        }

        Ok(ctx.finalize())
    }

    /// Open a file and digest it.
    pub fn hash_path(&self, path: &Path) -> Result<Digest> {
        let mut file = File::open(path)?;
        self.hash_file(&mut file)
    }

    /// Digest the canonical serialization of a directory record.
    pub fn digest_of(&self, directory: &Directory) -> Digest {
        self.hash_bytes(&directory.encode())
    }

    /// Serialize a directory record and return its digest with the bytes.
    pub fn encode_directory(&self, directory: &Directory) -> (Digest, Vec<u8>) {
        let bytes = directory.encode();
        (self.hash_bytes(&bytes), bytes)
    }
}

enum Hasher {
    Sha256(sha2::Sha256),
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

/// An in-progress digest computation.
///
/// Feed bytes with [`update`](Self::update) as they are produced for some
/// other purpose, then call [`finalize`](Self::finalize).
pub struct HashingContext {
    hasher: Hasher,
    size_bytes: u64,
}

impl HashingContext {
    fn new(function: HashFunction) -> Self {
        let hasher = match function {
            HashFunction::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashFunction::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashFunction::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self {
            hasher,
            size_bytes: 0,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
        self.size_bytes += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Finish the computation.
    pub fn finalize(self) -> Digest {
        let size = self.size_bytes;
        match self.hasher {
            Hasher::Sha256(h) => Digest::from_raw(&h.finalize(), size),
            Hasher::Sha1(h) => Digest::from_raw(&h.finalize(), size),
            Hasher::Blake3(h) => Digest::from_raw(h.finalize().as_bytes(), size),
        }
    }
}

impl fmt::Debug for HashingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function = match self.hasher {
            Hasher::Sha256(_) => HashFunction::Sha256,
            Hasher::Sha1(_) => HashFunction::Sha1,
            Hasher::Blake3(_) => HashFunction::Blake3,
        };
        f.debug_struct("HashingContext")
            .field("function", &function)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}
