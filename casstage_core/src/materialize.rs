//! Fetching a CAS tree onto the local filesystem.

use crate::digest::Digest;
use crate::directory::Directory;
use crate::error::Result;
use crate::remote::CasClient;
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Counters for one materialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    /// Blobs fetched remotely; repeated digests are copied locally instead.
    pub blobs_fetched: usize,
}

/// Writes the tree under a root digest into a local directory.
pub struct Materializer<'a, C: CasClient> {
    client: &'a C,
    policy: &'a RetryPolicy,
    fetched: HashMap<Digest, PathBuf>,
    stats: MaterializeStats,
}

impl<'a, C: CasClient> Materializer<'a, C> {
    pub fn new(client: &'a C, policy: &'a RetryPolicy) -> Self {
        Self {
            client,
            policy,
            fetched: HashMap::new(),
            stats: MaterializeStats::default(),
        }
    }

    /// Fetch and decode one directory record.
    pub fn fetch_directory(&self, digest: &Digest) -> Result<Directory> {
        let bytes = self
            .policy
            .run("read_blob", |ctx| self.client.read_blob(ctx, digest))?;
        Directory::decode(&bytes)
    }

    /// Materialize the tree rooted at `root` into `dest`, creating `dest`.
    pub fn materialize(mut self, root: &Digest, dest: &Path) -> Result<MaterializeStats> {
        self.materialize_tree(root, dest)?;
        tracing::debug!(
            root = %root.short(),
            dest = %dest.display(),
            files = self.stats.files,
            fetched = self.stats.blobs_fetched,
            "materialized tree"
        );
        Ok(self.stats)
    }

    fn materialize_tree(&mut self, digest: &Digest, dest: &Path) -> Result<()> {
        let directory = self.fetch_directory(digest)?;

        fs::create_dir_all(dest)?;
        self.stats.directories += 1;

        for file in &directory.files {
            let entry_path = dest.join(&file.name);
            self.materialize_blob(&file.digest, &entry_path)?;
            set_executable(&entry_path, file.is_executable)?;
            self.stats.files += 1;
        }

        for link in &directory.symlinks {
            create_symlink(&link.target, &dest.join(&link.name))?;
            self.stats.symlinks += 1;
        }

        for sub in &directory.directories {
            self.materialize_tree(&sub.digest, &dest.join(&sub.name))?;
        }

        Ok(())
    }

    fn materialize_blob(&mut self, digest: &Digest, dest: &Path) -> Result<()> {
        if let Some(existing) = self.fetched.get(digest) {
            fs::copy(existing, dest)?;
            return Ok(());
        }

        let data = self
            .policy
            .run("read_blob", |ctx| self.client.read_blob(ctx, digest))?;
        fs::write(dest, data)?;

        self.stats.blobs_fetched += 1;
        self.fetched.insert(digest.clone(), dest.to_path_buf());
        Ok(())
    }
}

/// Set file permissions from the executable flag.
#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set file permissions (Windows no-op).
#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    tracing::warn!(link = %link.display(), target, "symlinks are not supported on this platform");
    Ok(())
}
