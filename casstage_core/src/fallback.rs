//! Staging through the CAS client, without a broker.

use crate::action::{OutputDirectory, OutputFile};
use crate::defer::{Deferred, run_logged};
use crate::digest::Digest;
use crate::directory::NodeProperty;
use crate::error::Result;
use crate::hash::DigestGenerator;
use crate::materialize::Materializer;
use crate::remote::CasClient;
use crate::retry::RetryPolicy;
use crate::staging::{StagedDirectory, entry_type, resolve_within};
use crate::walk::Uploader;
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of the private directories created under the staging root.
const STAGE_PREFIX: &str = "stage-";

/// A tree fetched into a private directory under the staging root.
///
/// The directory is removed when this value is dropped.
#[derive(Debug)]
pub struct FallbackStagedDirectory<C: CasClient> {
    client: C,
    generator: DigestGenerator,
    policy: RetryPolicy,
    root_digest: Digest,
    path: PathBuf,
}

impl<C: CasClient> FallbackStagedDirectory<C> {
    /// Create a unique directory under `staging_root` and fetch `root` into it.
    ///
    /// A partially fetched tree is removed before the error is returned.
    pub fn new(
        client: C,
        generator: DigestGenerator,
        policy: RetryPolicy,
        staging_root: &Path,
        root: &Digest,
    ) -> Result<Self> {
        fs::create_dir_all(staging_root)?;
        let path = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempdir_in(staging_root)?
            .keep();

        let cleanup = Deferred::new("remove partially staged tree", || {
            fs::remove_dir_all(&path)?;
            Ok(())
        });
        let stats = Materializer::new(&client, &policy).materialize(root, &path)?;
        cleanup.cancel();

        tracing::debug!(
            root = %root.short(),
            path = %path.display(),
            files = stats.files,
            directories = stats.directories,
            "staged tree"
        );

        Ok(Self {
            client,
            generator,
            policy,
            root_digest: root.clone(),
            path,
        })
    }

    fn uploader(&self) -> Uploader<'_, C> {
        Uploader::new(&self.client, self.generator, &self.policy)
    }
}

impl<C: CasClient> StagedDirectory for FallbackStagedDirectory<C> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn root_digest(&self) -> &Digest {
        &self.root_digest
    }

    fn capture_file(
        &self,
        relative: &Path,
        node_properties: &[NodeProperty],
    ) -> Result<Option<OutputFile>> {
        let full = resolve_within(&self.path, relative)?;
        if !entry_type(&self.path, &full).is_some_and(|t| t.is_file()) {
            return Ok(None);
        }

        let (digest, is_executable) = self.uploader().upload_file(&full)?;
        tracing::debug!(path = %relative.display(), digest = %digest.short(), "captured file");

        Ok(Some(OutputFile {
            path: relative.to_path_buf(),
            digest,
            is_executable,
            node_properties: node_properties.to_vec(),
        }))
    }

    fn capture_directory(
        &self,
        relative: &Path,
        node_properties: &[NodeProperty],
    ) -> Result<Option<OutputDirectory>> {
        let full = resolve_within(&self.path, relative)?;
        if !entry_type(&self.path, &full).is_some_and(|t| t.is_dir()) {
            return Ok(None);
        }

        let tree_digest = self.uploader().upload_directory(&full, node_properties)?;
        tracing::debug!(path = %relative.display(), digest = %tree_digest.short(), "captured directory");

        Ok(Some(OutputDirectory {
            path: relative.to_path_buf(),
            tree_digest,
        }))
    }
}

impl<C: CasClient> Drop for FallbackStagedDirectory<C> {
    fn drop(&mut self) {
        let path = &self.path;
        if run_logged("remove staged tree", || Ok(fs::remove_dir_all(path)?)) {
            tracing::debug!(path = %path.display(), "released staged tree");
        }
    }
}
