//! An on-disk content-addressed store usable as a [`CasClient`].

use crate::digest::Digest;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::hash::{DigestGenerator, HashFunction};
use crate::object::{CompressionType, HEADER_SIZE, ObjectHeader};
use crate::remote::{CallContext, CasClient, Code, Status, StatusResult};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Compression threshold: blobs >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// A content-addressed store rooted at a local directory.
///
/// Layout:
/// - `objects/<function>/<first 2 hex chars>/<rest of hash>-<size>`
/// - `config` file with version and hash function
#[derive(Debug)]
pub struct LocalCas {
    root: PathBuf,
    generator: DigestGenerator,
}

impl LocalCas {
    /// Initialize a new store at the given path.
    pub fn init<P: AsRef<Path>>(root: P, function: HashFunction) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("objects").join(function.as_str()))?;

        let config_content = format!("version=1\nhash={}\n", function.as_str());
        fs::write(root.join("config"), config_content)?;

        tracing::debug!(root = %root.display(), %function, "initialized local store");

        Ok(Self {
            root,
            generator: DigestGenerator::new(function),
        })
    }

    /// Open an existing store at the given path.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config_content = fs::read_to_string(&config_path)?;
        let function = Self::parse_config(&root, &config_content)?;

        if !root.join("objects").join(function.as_str()).exists() {
            return Err(Error::invalid_store(
                &root,
                "objects directory structure missing",
            ));
        }

        Ok(Self {
            root,
            generator: DigestGenerator::new(function),
        })
    }

    /// Open the store at `root`, creating it first if it does not exist.
    pub fn open_or_init<P: AsRef<Path>>(root: P, function: HashFunction) -> Result<Self> {
        if root.as_ref().join("config").exists() {
            Self::open(root)
        } else {
            Self::init(root, function)
        }
    }

    /// Parse the config file to extract the hash function.
    fn parse_config(root: &Path, content: &str) -> Result<HashFunction> {
        let mut version = None;
        let mut hash = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "hash" => hash = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_store(
                root,
                format!("Unsupported config version: {version:?}"),
            ));
        }

        let name = hash.ok_or_else(|| Error::invalid_store(root, "Missing hash in config"))?;
        HashFunction::parse(name)
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the generator matching this store's hash function.
    pub fn generator(&self) -> DigestGenerator {
        self.generator
    }

    /// Get the path to an object file given its digest.
    pub fn object_path(&self, digest: &Digest) -> Result<PathBuf> {
        let function = self.generator.function();
        Digest::validate_hash(&digest.hash)?;
        if digest.hash.len() != function.hex_len() {
            return Err(Error::invalid_digest(format!(
                "Expected {} hex characters for {function}, got {}",
                function.hex_len(),
                digest.hash.len()
            )));
        }

        let (prefix, suffix) = digest.hash.split_at(2);
        Ok(self
            .root
            .join("objects")
            .join(function.as_str())
            .join(prefix)
            .join(format!("{suffix}-{}", digest.size_bytes)))
    }

    /// Whether the store holds an object for `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_ok_and(|p| p.exists())
    }

    /// Store a blob and return its digest.
    pub fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = self.generator.hash_bytes(data);
        self.put_verified(&digest, data)?;
        Ok(digest)
    }

    fn put_verified(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let obj_path = self.object_path(digest)?;
        if obj_path.exists() {
            return Ok(());
        }

        let (payload, compression) = if data.len() >= COMPRESSION_THRESHOLD {
            (compress_zstd(data)?, CompressionType::Zstd)
        } else {
            (data.to_vec(), CompressionType::None)
        };

        let header = ObjectHeader::new(
            self.generator.function(),
            compression,
            payload.len() as u64,
        );

        self.write_object_atomic(&obj_path, &header, &payload)
    }

    /// Write an object atomically using tempfile.
    fn write_object_atomic(
        &self,
        obj_path: &Path,
        header: &ObjectHeader,
        payload: &[u8],
    ) -> Result<()> {
        let parent = obj_path
            .parent()
            .ok_or_else(|| Error::invalid_store(&self.root, "object path has no parent"))?;
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(&header.encode())?;
        temp_file.write_all(payload)?;
        temp_file.flush()?;
        temp_file.persist(obj_path)?;

        Ok(())
    }

    /// Retrieve a blob, verifying it against its digest.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let obj_path = self.object_path(digest)?;
        if !obj_path.exists() {
            return Err(Error::object_not_found(digest.to_string()));
        }

        let mut file = fs::File::open(&obj_path)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ObjectHeader::decode(&header_buf, &obj_path)?;

        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;

        if payload.len() as u64 != header.payload_len {
            return Err(Error::corrupted_object(
                &obj_path,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    header.payload_len,
                    payload.len()
                ),
            ));
        }

        let data = match header.compression {
            CompressionType::None => payload,
            CompressionType::Zstd => decompress_zstd(&payload)?,
        };

        let computed = self.generator.hash_bytes(&data);
        if computed != *digest {
            return Err(Error::corrupted_object(
                &obj_path,
                format!("Digest mismatch: expected {digest}, got {computed}"),
            ));
        }

        Ok(data)
    }

    /// Store a directory record and return its digest.
    pub fn put_directory(&self, directory: &Directory) -> Result<Digest> {
        self.put(&directory.encode())
    }

    /// Retrieve and decode a directory record.
    pub fn get_directory(&self, digest: &Digest) -> Result<Directory> {
        Directory::decode(&self.get(digest)?)
    }
}

/// Map a local failure to the status a remote service would report.
pub(crate) fn error_to_status(err: &Error) -> Status {
    let code = match err {
        Error::ObjectNotFound { .. } => Code::NotFound,
        Error::CorruptedObject { .. } => Code::DataLoss,
        Error::InvalidDigest { .. } | Error::InvalidDirectory { .. } => Code::InvalidArgument,
        Error::Io { source } if source.kind() == std::io::ErrorKind::NotFound => Code::NotFound,
        Error::Io { source } if source.kind() == std::io::ErrorKind::PermissionDenied => {
            Code::PermissionDenied
        }
        Error::Remote { status } | Error::RetryLimitExceeded { status, .. } => status.code,
        _ => Code::Internal,
    };
    Status::new(code, err.to_string())
}

impl CasClient for LocalCas {
    fn find_missing_blobs(
        &self,
        _ctx: &mut CallContext,
        digests: &[Digest],
    ) -> StatusResult<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            self.object_path(digest)
                .map_err(|e| error_to_status(&e))?;
            if !self.contains(digest) && !missing.contains(digest) {
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }

    fn read_blob(&self, _ctx: &mut CallContext, digest: &Digest) -> StatusResult<Vec<u8>> {
        self.get(digest).map_err(|e| error_to_status(&e))
    }

    fn write_blob(&self, _ctx: &mut CallContext, digest: &Digest, data: &[u8]) -> StatusResult<()> {
        let computed = self.generator.hash_bytes(data);
        if computed != *digest {
            return Err(Status::invalid_argument(format!(
                "Digest mismatch: declared {digest}, computed {computed}"
            )));
        }
        self.put_verified(digest, data)
            .map_err(|e| error_to_status(&e))
    }
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    // Level 3 = fast compression
    Ok(zstd::encode_all(data, 3)?)
}

/// Decompress data using zstd.
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::decode_all(data)?)
}
