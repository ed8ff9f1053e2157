//! Staging delegated to a local broker.

use crate::action::{OutputDirectory, OutputFile};
use crate::defer::run_logged;
use crate::digest::Digest;
use crate::directory::NodeProperty;
use crate::error::{Error, Result};
use crate::remote::{Broker, Status};
use crate::retry::RetryPolicy;
use crate::staging::{StagedDirectory, entry_type, resolve_within};
use std::path::{Path, PathBuf};

/// A tree staged by a [`Broker`] at a path the broker chose.
///
/// The broker is asked to unstage the tree when this value is dropped.
#[derive(Debug)]
pub struct BrokerStagedDirectory<B: Broker> {
    broker: B,
    policy: RetryPolicy,
    root_digest: Digest,
    path: PathBuf,
}

impl<B: Broker> BrokerStagedDirectory<B> {
    /// Ask the broker to stage `root`, optionally at a requested path.
    pub fn new(
        broker: B,
        policy: RetryPolicy,
        root: &Digest,
        requested_path: Option<&Path>,
    ) -> Result<Self> {
        let path = policy.run("stage_tree", |ctx| {
            broker.stage_tree(ctx, root, requested_path)
        })?;
        tracing::debug!(root = %root.short(), path = %path.display(), "broker staged tree");

        Ok(Self {
            broker,
            policy,
            root_digest: root.clone(),
            path,
        })
    }
}

/// Missing digest on an otherwise successful capture.
fn missing_digest(path: &Path) -> Error {
    Error::capture(path, &Status::internal("broker returned no digest"))
}

impl<B: Broker> StagedDirectory for BrokerStagedDirectory<B> {
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

        let response = self.policy.run("capture_files", |ctx| {
            self.broker
                .capture_files(ctx, &self.path, std::slice::from_ref(&full), node_properties)
        })?;

        let captured = response
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| Error::empty_capture_response(&full))?;
        if !captured.status.is_ok() {
            return Err(Error::capture(&full, &captured.status));
        }
        let digest = captured.digest.ok_or_else(|| missing_digest(&full))?;

        Ok(Some(OutputFile {
            path: relative.to_path_buf(),
            digest,
            is_executable: captured.is_executable,
            node_properties: captured.node_properties,
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

        let response = self.policy.run("capture_tree", |ctx| {
            self.broker
                .capture_tree(ctx, &self.path, std::slice::from_ref(&full), node_properties)
        })?;

        let captured = response
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| Error::empty_capture_response(&full))?;
        if !captured.status.is_ok() {
            return Err(Error::capture(&full, &captured.status));
        }
        let tree_digest = captured.tree_digest.ok_or_else(|| missing_digest(&full))?;

        Ok(Some(OutputDirectory {
            path: relative.to_path_buf(),
            tree_digest,
        }))
    }
}

impl<B: Broker> Drop for BrokerStagedDirectory<B> {
    fn drop(&mut self) {
        let released = run_logged("unstage tree", || {
            self.policy.run("unstage_tree", |ctx| {
                self.broker.unstage_tree(ctx, &self.root_digest, &self.path)
            })
        });
        if released {
            tracing::debug!(path = %self.path.display(), "broker released staged tree");
        }
    }
}
