//! Declared outputs of a command and the records captured for them.

use crate::digest::Digest;
use crate::directory::NodeProperty;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Paths a command is expected to produce, relative to its working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Working directory of the command, relative to the staged root.
    #[serde(default)]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default)]
    pub output_directories: Vec<PathBuf>,
    /// Properties recorded on every captured file.
    #[serde(default)]
    pub output_node_properties: Vec<NodeProperty>,
}

impl OutputSpec {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_files.push(path.into());
        self
    }

    pub fn with_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_directories.push(path.into());
        self
    }

    /// Path of a declared output relative to the staged root.
    pub fn resolve(&self, declared: &Path) -> PathBuf {
        if self.working_directory.as_os_str().is_empty() {
            declared.to_path_buf()
        } else {
            self.working_directory.join(declared)
        }
    }
}

/// A captured output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub digest: Digest,
    pub is_executable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_properties: Vec<NodeProperty>,
}

/// A captured output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirectory {
    pub path: PathBuf,
    /// Digest of the root `Directory` record of the captured subtree.
    pub tree_digest: Digest,
}

/// Everything captured for one command run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub output_files: Vec<OutputFile>,
    pub output_directories: Vec<OutputDirectory>,
    #[serde(default)]
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_against_working_directory() {
        let spec = OutputSpec::new("pkg/build").with_file("out.txt");
        assert_eq!(
            spec.resolve(&spec.output_files[0]),
            PathBuf::from("pkg/build/out.txt")
        );

        let root_spec = OutputSpec::default().with_directory("gen");
        assert_eq!(
            root_spec.resolve(&root_spec.output_directories[0]),
            PathBuf::from("gen")
        );
    }

    #[test]
    fn test_action_result_json() {
        let result = ActionResult {
            output_files: vec![OutputFile {
                path: "out.txt".into(),
                digest: Digest::new("ab", 2),
                is_executable: false,
                node_properties: vec![],
            }],
            output_directories: vec![],
            exit_code: 0,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["output_files"][0]["path"], "out.txt");
        assert_eq!(json["output_files"][0]["digest"]["hash"], "ab");
        assert!(json["output_files"][0].get("node_properties").is_none());

        let back: ActionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
