//! Filesystem walking and upload of local content into CAS.

use crate::digest::Digest;
use crate::directory::{Directory, NodeProperty};
use crate::error::{Error, Result};
use crate::hash::DigestGenerator;
use crate::remote::CasClient;
use crate::retry::RetryPolicy;
use std::fs;
use std::path::Path;

/// Hashes local files and directories and uploads whatever the CAS lacks.
#[derive(Debug)]
pub struct Uploader<'a, C: CasClient> {
    client: &'a C,
    generator: DigestGenerator,
    policy: &'a RetryPolicy,
}

impl<'a, C: CasClient> Uploader<'a, C> {
    pub fn new(client: &'a C, generator: DigestGenerator, policy: &'a RetryPolicy) -> Self {
        Self {
            client,
            generator,
            policy,
        }
    }

    /// Upload `data` under `digest` unless the CAS already holds it.
    pub fn upload_blob(&self, digest: &Digest, data: &[u8]) -> Result<bool> {
        if !self.is_missing(digest)? {
            return Ok(false);
        }
        self.policy
            .run("write_blob", |ctx| self.client.write_blob(ctx, digest, data))?;
        Ok(true)
    }

    fn is_missing(&self, digest: &Digest) -> Result<bool> {
        let missing = self.policy.run("find_missing_blobs", |ctx| {
            self.client
                .find_missing_blobs(ctx, std::slice::from_ref(digest))
        })?;
        Ok(missing.contains(digest))
    }

    /// Hash a regular file and upload it if missing.
    ///
    /// Returns the digest and whether any execute bit is set.
    pub fn upload_file(&self, path: &Path) -> Result<(Digest, bool)> {
        let mut file = fs::File::open(path)?;
        let metadata = file.metadata()?;
        let digest = self.generator.hash_file(&mut file)?;

        if self.is_missing(&digest)? {
            let data = fs::read(path)?;
            if data.len() as u64 != digest.size_bytes {
                return Err(Error::Io {
                    source: std::io::Error::other(format!(
                        "File changed while capturing: {}",
                        path.display()
                    )),
                });
            }
            self.policy
                .run("write_blob", |ctx| self.client.write_blob(ctx, &digest, &data))?;
            tracing::debug!(path = %path.display(), digest = %digest.short(), "uploaded file");
        }

        Ok((digest, is_executable(&metadata)))
    }

    /// Upload a directory recursively and return the digest of its root record.
    ///
    /// `node_properties` are recorded on every file in the tree.
    pub fn upload_directory(&self, path: &Path, node_properties: &[NodeProperty]) -> Result<Digest> {
        let mut directory = Directory::new();

        let walker = ignore::WalkBuilder::new(path)
            .max_depth(Some(1)) // Only immediate children
            .standard_filters(false) // Outputs are captured as-is, dotfiles included
            .follow_links(false)
            .build();

        for entry in walker {
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }

            let entry_path = entry.path();
            let file_name = entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::invalid_directory(format!(
                        "Invalid filename: {}",
                        entry_path.display()
                    ))
                })?
                .to_string();

            let file_type = match entry.file_type() {
                Some(file_type) => file_type,
                None => fs::symlink_metadata(entry_path)?.file_type(),
            };

            if file_type.is_symlink() {
                let target = fs::read_link(entry_path)?;
                let target = target.to_str().ok_or_else(|| {
                    Error::invalid_directory(format!(
                        "Symlink target is not UTF-8: {}",
                        entry_path.display()
                    ))
                })?;
                directory.add_symlink(file_name, target)?;
            } else if file_type.is_dir() {
                let digest = self.upload_directory(entry_path, node_properties)?;
                directory.add_directory(file_name, digest)?;
            } else if file_type.is_file() {
                let (digest, executable) = self.upload_file(entry_path)?;
                directory.add_file(file_name, digest, executable, node_properties.to_vec())?;
            } else {
                tracing::warn!(path = %entry_path.display(), "skipping special file");
            }
        }

        let (digest, bytes) = self.generator.encode_directory(&directory);
        self.upload_blob(&digest, &bytes)?;
        Ok(digest)
    }
}

/// Whether any execute bit is set.
#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

/// Whether any execute bit is set (Windows fallback).
#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
