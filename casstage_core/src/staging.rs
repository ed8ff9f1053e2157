//! Staged directories: a CAS tree materialized on local disk, with capture
//! of the outputs a command leaves behind.
//!
//! Two strategies implement [`StagedDirectory`]:
//!
//! - [`FallbackStagedDirectory`] fetches the tree itself through a
//!   [`CasClient`] and uploads captured content the same way.
//! - [`BrokerStagedDirectory`] delegates staging and capture to a local
//!   [`Broker`].
//!
//! The staged path is released when the value is dropped. Release failures
//! are logged and never propagated.

use crate::action::{ActionResult, OutputDirectory, OutputFile, OutputSpec};
use crate::brokered::BrokerStagedDirectory;
use crate::digest::Digest;
use crate::directory::NodeProperty;
use crate::error::{Error, Result};
use crate::fallback::FallbackStagedDirectory;
use crate::hash::DigestGenerator;
use crate::remote::{Broker, CasClient};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// A CAS tree materialized at a local path.
pub trait StagedDirectory {
    /// Local path of the staged root.
    fn path(&self) -> &Path;

    /// Digest of the root `Directory` that was staged.
    fn root_digest(&self) -> &Digest;

    /// Capture one regular file, relative to the staged root.
    ///
    /// Returns `Ok(None)` when no regular file exists at the path.
    fn capture_file(
        &self,
        relative: &Path,
        node_properties: &[NodeProperty],
    ) -> Result<Option<OutputFile>>;

    /// Capture one directory tree, relative to the staged root.
    ///
    /// Returns `Ok(None)` when no directory exists at the path.
    fn capture_directory(
        &self,
        relative: &Path,
        node_properties: &[NodeProperty],
    ) -> Result<Option<OutputDirectory>>;

    /// Capture every declared output of `spec` into `result`.
    ///
    /// Declared paths are resolved against the working directory; the
    /// records appended to `result` carry the declared path. Absent
    /// outputs are skipped.
    fn capture_all_outputs(&self, spec: &OutputSpec, result: &mut ActionResult) -> Result<()> {
        for declared in &spec.output_files {
            let resolved = spec.resolve(declared);
            match self.capture_file(&resolved, &spec.output_node_properties)? {
                Some(mut file) => {
                    file.path = declared.clone();
                    result.output_files.push(file);
                }
                None => {
                    tracing::debug!(path = %declared.display(), "declared output file not produced");
                }
            }
        }

        for declared in &spec.output_directories {
            let resolved = spec.resolve(declared);
            match self.capture_directory(&resolved, &spec.output_node_properties)? {
                Some(mut directory) => {
                    directory.path = declared.clone();
                    result.output_directories.push(directory);
                }
                None => {
                    tracing::debug!(path = %declared.display(), "declared output directory not produced");
                }
            }
        }

        Ok(())
    }
}

impl<T: StagedDirectory + ?Sized> StagedDirectory for Box<T> {
    fn path(&self) -> &Path {
        (**self).path()
    }

    fn root_digest(&self) -> &Digest {
        (**self).root_digest()
    }

    fn capture_file(
        &self,
        relative: &Path,
        node_properties: &[NodeProperty],
    ) -> Result<Option<OutputFile>> {
        (**self).capture_file(relative, node_properties)
    }

    fn capture_directory(
        &self,
        relative: &Path,
        node_properties: &[NodeProperty],
    ) -> Result<Option<OutputDirectory>> {
        (**self).capture_directory(relative, node_properties)
    }
}

/// Join `relative` onto `root`, refusing paths that leave `root`.
pub(crate) fn resolve_within(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::staging_failed(format!(
                    "Output path escapes the staged root: {}",
                    relative.display()
                )));
            }
        }
    }
    Ok(resolved)
}

/// File type of the entry at `full`, provided it lies inside `root`.
///
/// A final symlink is reported as a symlink rather than as its target. A
/// path that resolves outside `root` through a symlinked parent is absent.
pub(crate) fn entry_type(root: &Path, full: &Path) -> Option<fs::FileType> {
    let file_type = fs::symlink_metadata(full).ok()?.file_type();
    if file_type.is_symlink() {
        return Some(file_type);
    }
    let resolved = full.canonicalize().ok()?;
    let root = root.canonicalize().ok()?;
    resolved.starts_with(&root).then_some(file_type)
}

/// How a tree is staged and captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingStrategy {
    /// Fetch and upload through the CAS client directly.
    #[default]
    Fallback,
    /// Delegate to a local broker.
    Broker,
}

impl StagingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStrategy::Fallback => "fallback",
            StagingStrategy::Broker => "broker",
        }
    }
}

impl fmt::Display for StagingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StagingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fallback" => Ok(StagingStrategy::Fallback),
            "broker" => Ok(StagingStrategy::Broker),
            other => Err(Error::staging_failed(format!(
                "Unknown staging strategy: {other}"
            ))),
        }
    }
}

/// Builds staged directories with the configured strategy.
pub struct Stager<'a> {
    strategy: StagingStrategy,
    client: &'a dyn CasClient,
    broker: Option<&'a dyn Broker>,
    generator: DigestGenerator,
    policy: RetryPolicy,
    staging_root: PathBuf,
}

impl<'a> Stager<'a> {
    /// A fallback stager creating directories under `staging_root`.
    pub fn new(client: &'a dyn CasClient, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            strategy: StagingStrategy::Fallback,
            client,
            broker: None,
            generator: DigestGenerator::default(),
            policy: RetryPolicy::default(),
            staging_root: staging_root.into(),
        }
    }

    pub fn with_strategy(mut self, strategy: StagingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_broker(mut self, broker: &'a dyn Broker) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_generator(mut self, generator: DigestGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn strategy(&self) -> StagingStrategy {
        self.strategy
    }

    /// Stage the tree under `root`.
    pub fn stage(&self, root: &Digest) -> Result<Box<dyn StagedDirectory + 'a>> {
        match self.strategy {
            StagingStrategy::Fallback => {
                let staged = FallbackStagedDirectory::new(
                    self.client,
                    self.generator,
                    self.policy.clone(),
                    &self.staging_root,
                    root,
                )?;
                Ok(Box::new(staged))
            }
            StagingStrategy::Broker => {
                let broker = self.broker.ok_or_else(|| {
                    Error::staging_failed("Broker strategy selected but no broker configured")
                })?;
                let staged = BrokerStagedDirectory::new(broker, self.policy.clone(), root, None)?;
                Ok(Box::new(staged))
            }
        }
    }
}

impl fmt::Debug for Stager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stager")
            .field("strategy", &self.strategy)
            .field("has_broker", &self.broker.is_some())
            .field("generator", &self.generator)
            .field("policy", &self.policy)
            .field("staging_root", &self.staging_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::directory::Directory;
    use crate::hash::HashFunction;
    use crate::store::LocalCas;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_within() {
        let root = Path::new("/stage/x");
        assert_eq!(
            resolve_within(root, Path::new("./a/b.txt")).unwrap(),
            PathBuf::from("/stage/x/a/b.txt")
        );
        assert!(resolve_within(root, Path::new("../escape")).is_err());
        assert!(resolve_within(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "Broker".parse::<StagingStrategy>().unwrap(),
            StagingStrategy::Broker
        );
        assert_eq!(StagingStrategy::default(), StagingStrategy::Fallback);
        assert!("nfs".parse::<StagingStrategy>().is_err());
    }

    /// Records what `capture_all_outputs` asks for and answers from a fixed set.
    struct Recording {
        root: Digest,
        present_files: Vec<PathBuf>,
        present_dirs: Vec<PathBuf>,
        asked: RefCell<Vec<PathBuf>>,
    }

    impl StagedDirectory for Recording {
        fn path(&self) -> &Path {
            Path::new("/nowhere")
        }

        fn root_digest(&self) -> &Digest {
            &self.root
        }

        fn capture_file(
            &self,
            relative: &Path,
            node_properties: &[NodeProperty],
        ) -> Result<Option<OutputFile>> {
            self.asked.borrow_mut().push(relative.to_path_buf());
            Ok(self
                .present_files
                .contains(&relative.to_path_buf())
                .then(|| OutputFile {
                    path: relative.to_path_buf(),
                    digest: self.root.clone(),
                    is_executable: false,
                    node_properties: node_properties.to_vec(),
                }))
        }

        fn capture_directory(
            &self,
            relative: &Path,
            _node_properties: &[NodeProperty],
        ) -> Result<Option<OutputDirectory>> {
            self.asked.borrow_mut().push(relative.to_path_buf());
            Ok(self
                .present_dirs
                .contains(&relative.to_path_buf())
                .then(|| OutputDirectory {
                    path: relative.to_path_buf(),
                    tree_digest: self.root.clone(),
                }))
        }
    }

    #[test]
    fn test_capture_all_outputs_renames_and_skips_absent() {
        let staged = Recording {
            root: Digest::new("ab", 1),
            present_files: vec![PathBuf::from("work/out.txt")],
            present_dirs: vec![PathBuf::from("work/gen")],
            asked: RefCell::new(Vec::new()),
        };
        let spec = OutputSpec {
            output_node_properties: vec![NodeProperty::new("mtime", "0")],
            ..OutputSpec::new("work")
                .with_file("out.txt")
                .with_file("missing.txt")
                .with_directory("gen")
                .with_directory("nogen")
        };

        let mut result = ActionResult::default();
        staged.capture_all_outputs(&spec, &mut result).unwrap();

        assert_eq!(staged.asked.borrow().len(), 4);
        assert_eq!(result.output_files.len(), 1);
        assert_eq!(result.output_files[0].path, PathBuf::from("out.txt"));
        assert_eq!(result.output_files[0].node_properties, spec.output_node_properties);
        assert_eq!(result.output_directories.len(), 1);
        assert_eq!(result.output_directories[0].path, PathBuf::from("gen"));
    }

    fn stored_tree(cas: &LocalCas) -> Digest {
        let mut root = Directory::new();
        root.add_file("input.txt", cas.put(b"input").unwrap(), false, vec![])
            .unwrap();
        cas.put_directory(&root).unwrap()
    }

    #[test]
    fn test_stager_both_strategies() {
        let temp_dir = TempDir::new().unwrap();
        let cas = LocalCas::init(temp_dir.path().join("store"), HashFunction::Sha256).unwrap();
        let root = stored_tree(&cas);

        let broker = LocalBroker::new(
            LocalCas::open(cas.root()).unwrap(),
            temp_dir.path().join("broker"),
        );

        for strategy in [StagingStrategy::Fallback, StagingStrategy::Broker] {
            let stager = Stager::new(&cas, temp_dir.path().join("stage"))
                .with_generator(cas.generator())
                .with_broker(&broker)
                .with_strategy(strategy);

            let staged = stager.stage(&root).unwrap();
            let path = staged.path().to_path_buf();
            assert_eq!(staged.root_digest(), &root);
            assert_eq!(fs::read(path.join("input.txt")).unwrap(), b"input");

            drop(staged);
            assert!(!path.exists(), "{strategy} left {} behind", path.display());
        }
    }

    #[test]
    fn test_broker_strategy_without_broker() {
        let temp_dir = TempDir::new().unwrap();
        let cas = LocalCas::init(temp_dir.path().join("store"), HashFunction::Sha256).unwrap();
        let root = stored_tree(&cas);

        let stager = Stager::new(&cas, temp_dir.path()).with_strategy(StagingStrategy::Broker);
        assert!(matches!(
            stager.stage(&root),
            Err(Error::StagingFailed { .. })
        ));
    }
}
