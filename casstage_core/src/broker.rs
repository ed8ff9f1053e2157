//! An in-process [`Broker`] over a [`LocalCas`].

use crate::defer::run_logged;
use crate::digest::Digest;
use crate::directory::NodeProperty;
use crate::error::{Error, Result};
use crate::materialize::Materializer;
use crate::remote::{
    Broker, CallContext, CaptureFilesResponse, CaptureTreeResponse, CapturedFile, CapturedTree,
    Code, Status, StatusResult,
};
use crate::retry::RetryPolicy;
use crate::staging::entry_type;
use crate::store::{LocalCas, error_to_status};
use crate::walk::Uploader;
use std::fs;
use std::path::{Path, PathBuf};

/// Stages and captures on behalf of clients, backed by a local store.
///
/// Trees are staged under `staging_root` unless the caller asks for a path.
#[derive(Debug)]
pub struct LocalBroker {
    cas: LocalCas,
    staging_root: PathBuf,
    policy: RetryPolicy,
}

impl LocalBroker {
    pub fn new(cas: LocalCas, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            cas,
            staging_root: staging_root.into(),
            // Local store calls are not retried.
            policy: RetryPolicy::new(0, std::time::Duration::ZERO),
        }
    }

    pub fn cas(&self) -> &LocalCas {
        &self.cas
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    fn uploader(&self) -> Uploader<'_, LocalCas> {
        Uploader::new(&self.cas, self.cas.generator(), &self.policy)
    }

    fn stage_into(&self, root: &Digest, requested: Option<&Path>) -> Result<PathBuf> {
        let dest = match requested {
            Some(path) => {
                if path.exists() {
                    return Err(Error::path_exists(path));
                }
                path.to_path_buf()
            }
            None => {
                fs::create_dir_all(&self.staging_root)?;
                tempfile::Builder::new()
                    .prefix("broker-")
                    .tempdir_in(&self.staging_root)?
                    .keep()
            }
        };

        if let Err(err) = Materializer::new(&self.cas, &self.policy).materialize(root, &dest) {
            if dest.exists() {
                run_logged("remove partial broker stage", || Ok(fs::remove_dir_all(&dest)?));
            }
            return Err(err);
        }
        Ok(dest)
    }
}

/// Resolve a capture path against the staged root unless already absolute.
fn absolute(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

impl Broker for LocalBroker {
    fn stage_tree(
        &self,
        _ctx: &mut CallContext,
        root: &Digest,
        path: Option<&Path>,
    ) -> StatusResult<PathBuf> {
        let staged = self.stage_into(root, path).map_err(|err| match err {
            Error::PathExists { .. } => Status::new(Code::AlreadyExists, err.to_string()),
            other => error_to_status(&other),
        })?;
        tracing::debug!(root = %root.short(), path = %staged.display(), "broker staged tree");
        Ok(staged)
    }

    fn unstage_tree(&self, _ctx: &mut CallContext, root: &Digest, path: &Path) -> StatusResult<()> {
        if !path.is_dir() {
            return Err(Status::not_found(format!(
                "No staged tree at {}",
                path.display()
            )));
        }
        fs::remove_dir_all(path).map_err(|e| error_to_status(&Error::from(e)))?;
        tracing::debug!(root = %root.short(), path = %path.display(), "broker unstaged tree");
        Ok(())
    }

    fn capture_files(
        &self,
        _ctx: &mut CallContext,
        root: &Path,
        paths: &[PathBuf],
        node_properties: &[NodeProperty],
    ) -> StatusResult<CaptureFilesResponse> {
        let uploader = self.uploader();
        let responses = paths
            .iter()
            .map(|path| {
                let full = absolute(root, path);
                let mut captured = CapturedFile {
                    path: path.clone(),
                    digest: None,
                    is_executable: false,
                    node_properties: node_properties.to_vec(),
                    status: Status::ok(),
                };
                if !entry_type(root, &full).is_some_and(|t| t.is_file()) {
                    captured.status = Status::not_found(format!("No file at {}", full.display()));
                    return captured;
                }
                match uploader.upload_file(&full) {
                    Ok((digest, is_executable)) => {
                        captured.digest = Some(digest);
                        captured.is_executable = is_executable;
                    }
                    Err(err) => captured.status = error_to_status(&err),
                }
                captured
            })
            .collect();

        Ok(CaptureFilesResponse { responses })
    }

    fn capture_tree(
        &self,
        _ctx: &mut CallContext,
        root: &Path,
        paths: &[PathBuf],
        node_properties: &[NodeProperty],
    ) -> StatusResult<CaptureTreeResponse> {
        let uploader = self.uploader();
        let responses = paths
            .iter()
            .map(|path| {
                let full = absolute(root, path);
                if !entry_type(root, &full).is_some_and(|t| t.is_dir()) {
                    return CapturedTree {
                        path: path.clone(),
                        tree_digest: None,
                        status: Status::not_found(format!("No directory at {}", full.display())),
                    };
                }
                match uploader.upload_directory(&full, node_properties) {
                    Ok(digest) => CapturedTree {
                        path: path.clone(),
                        tree_digest: Some(digest),
                        status: Status::ok(),
                    },
                    Err(err) => CapturedTree {
                        path: path.clone(),
                        tree_digest: None,
                        status: error_to_status(&err),
                    },
                }
            })
            .collect();

        Ok(CaptureTreeResponse { responses })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::hash::HashFunction;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBroker, Digest) {
        let temp_dir = TempDir::new().unwrap();
        let cas = LocalCas::init(temp_dir.path().join("store"), HashFunction::Blake3).unwrap();

        let mut root = Directory::new();
        root.add_file("in.txt", cas.put(b"in").unwrap(), false, vec![])
            .unwrap();
        let root_digest = cas.put_directory(&root).unwrap();

        let broker = LocalBroker::new(cas, temp_dir.path().join("broker"));
        (temp_dir, broker, root_digest)
    }

    #[test]
    fn test_stage_and_unstage() {
        let (_temp, broker, root) = setup();
        let mut ctx = CallContext::default();

        let path = broker.stage_tree(&mut ctx, &root, None).unwrap();
        assert!(path.starts_with(broker.staging_root()));
        assert_eq!(fs::read(path.join("in.txt")).unwrap(), b"in");

        broker.unstage_tree(&mut ctx, &root, &path).unwrap();
        assert!(!path.exists());

        let err = broker.unstage_tree(&mut ctx, &root, &path).unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[test]
    fn test_stage_at_requested_path() {
        let (temp_dir, broker, root) = setup();
        let mut ctx = CallContext::default();
        let requested = temp_dir.path().join("here");

        let path = broker
            .stage_tree(&mut ctx, &root, Some(&requested))
            .unwrap();
        assert_eq!(path, requested);

        let err = broker
            .stage_tree(&mut ctx, &root, Some(&requested))
            .unwrap_err();
        assert_eq!(err.code, Code::AlreadyExists);
    }

    #[test]
    fn test_stage_unknown_root() {
        let (_temp, broker, _root) = setup();
        let mut ctx = CallContext::default();
        let unknown = broker.cas().generator().hash_bytes(b"unknown");

        let err = broker.stage_tree(&mut ctx, &unknown, None).unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert_eq!(fs::read_dir(broker.staging_root()).unwrap().count(), 0);
    }

    #[test]
    fn test_capture_per_item_status() {
        let (_temp, broker, root) = setup();
        let mut ctx = CallContext::default();
        let staged = broker.stage_tree(&mut ctx, &root, None).unwrap();
        fs::write(staged.join("out.bin"), b"out").unwrap();
        fs::create_dir(staged.join("gen")).unwrap();

        let files = broker
            .capture_files(
                &mut ctx,
                &staged,
                &[PathBuf::from("out.bin"), PathBuf::from("absent")],
                &[],
            )
            .unwrap();
        assert_eq!(files.responses.len(), 2);
        assert!(files.responses[0].status.is_ok());
        assert_eq!(
            files.responses[0].digest,
            Some(broker.cas().generator().hash_bytes(b"out"))
        );
        assert_eq!(files.responses[1].status.code, Code::NotFound);

        let trees = broker
            .capture_tree(&mut ctx, &staged, &[staged.join("gen")], &[])
            .unwrap();
        let tree_digest = trees.responses[0].tree_digest.clone().unwrap();
        assert!(broker.cas().get_directory(&tree_digest).unwrap().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_capture_symlink_is_not_found() {
        let (temp_dir, broker, root) = setup();
        let mut ctx = CallContext::default();
        let staged = broker.stage_tree(&mut ctx, &root, None).unwrap();
        let outside = temp_dir.path().join("outside.txt");
        fs::write(&outside, b"outside").unwrap();
        std::os::unix::fs::symlink(&outside, staged.join("out.txt")).unwrap();

        let files = broker
            .capture_files(&mut ctx, &staged, &[PathBuf::from("out.txt")], &[])
            .unwrap();
        assert_eq!(files.responses[0].status.code, Code::NotFound);
        assert!(files.responses[0].digest.is_none());

        let trees = broker
            .capture_tree(&mut ctx, &staged, &[temp_dir.path().to_path_buf()], &[])
            .unwrap();
        assert_eq!(trees.responses[0].status.code, Code::NotFound);
    }

    #[test]
    fn test_failed_stage_keeps_original_error() {
        let (temp_dir, broker, _root) = setup();
        let mut ctx = CallContext::default();
        let mut partial = Directory::new();
        partial
            .add_file("kept.txt", broker.cas().put(b"kept").unwrap(), false, vec![])
            .unwrap();
        let never_stored = broker.cas().generator().hash_bytes(b"never stored");
        partial.add_file("gone.txt", never_stored, false, vec![]).unwrap();
        let partial = broker.cas().put_directory(&partial).unwrap();
        let requested = temp_dir.path().join("requested");

        let err = broker
            .stage_tree(&mut ctx, &partial, Some(&requested))
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert!(!requested.exists());
    }
}
