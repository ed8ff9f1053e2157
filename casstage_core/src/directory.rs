//! Directory records and their canonical encoding.
//!
//! A `Directory` lists files, subdirectories and symlinks by name. Child
//! directories are referenced by the digest of their own encoded record, so
//! a root digest commits to the whole tree beneath it.

use crate::digest::Digest;
use crate::error::{Error, Result};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Longest entry name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// A free-form `(name, value)` pair attached to a file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeProperty {
    pub name: String,
    pub value: String,
}

impl NodeProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
    pub node_properties: Vec<NodeProperty>,
}

/// A subdirectory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// A symlink entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

/// Borrowed view of one named entry of any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    File(&'a FileNode),
    Directory(&'a DirectoryNode),
    Symlink(&'a SymlinkNode),
}

/// One directory record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
    pub symlinks: Vec<SymlinkNode>,
}

/// Check an entry name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_directory("Name cannot be empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_directory(format!(
            "Name too long: {} bytes (max {MAX_NAME_LEN})",
            name.len()
        )));
    }

    if name.contains('\0') {
        return Err(Error::invalid_directory("Name cannot contain null bytes"));
    }

    if name.contains('/') {
        return Err(Error::invalid_directory(format!(
            "Name cannot contain '/': {name}"
        )));
    }

    if name == "." || name == ".." {
        return Err(Error::invalid_directory(format!("Reserved name: {name}")));
    }

    Ok(())
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty() && self.symlinks.is_empty()
    }

    /// Add a file entry.
    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        digest: Digest,
        is_executable: bool,
        node_properties: Vec<NodeProperty>,
    ) -> Result<()> {
        let name = name.into();
        self.check_insert(&name)?;
        self.files.push(FileNode {
            name,
            digest,
            is_executable,
            node_properties,
        });
        Ok(())
    }

    /// Add a subdirectory entry.
    pub fn add_directory(&mut self, name: impl Into<String>, digest: Digest) -> Result<()> {
        let name = name.into();
        self.check_insert(&name)?;
        self.directories.push(DirectoryNode { name, digest });
        Ok(())
    }

    /// Add a symlink entry.
    pub fn add_symlink(&mut self, name: impl Into<String>, target: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.check_insert(&name)?;
        self.symlinks.push(SymlinkNode {
            name,
            target: target.into(),
        });
        Ok(())
    }

    fn check_insert(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.entry(name).is_some() {
            return Err(Error::invalid_directory(format!("Duplicate entry: {name}")));
        }
        Ok(())
    }

    /// Look up an entry of any kind by name.
    pub fn entry(&self, name: &str) -> Option<Entry<'_>> {
        if let Some(f) = self.files.iter().find(|f| f.name == name) {
            return Some(Entry::File(f));
        }
        if let Some(d) = self.directories.iter().find(|d| d.name == name) {
            return Some(Entry::Directory(d));
        }
        self.symlinks
            .iter()
            .find(|s| s.name == name)
            .map(Entry::Symlink)
    }

    /// All entry names, sorted.
    pub fn names(&self) -> BTreeSet<&str> {
        self.files
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.directories.iter().map(|d| d.name.as_str()))
            .chain(self.symlinks.iter().map(|s| s.name.as_str()))
            .collect()
    }

    /// Sort every entry list (and file properties) into canonical order.
    pub fn canonicalize(&mut self) {
        self.files.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        for file in &mut self.files {
            file.node_properties.sort();
        }
        self.directories
            .sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        self.symlinks
            .sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    }

    /// Check names and reject duplicates across entry kinds.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        let names = self
            .files
            .iter()
            .map(|f| &f.name)
            .chain(self.directories.iter().map(|d| &d.name))
            .chain(self.symlinks.iter().map(|s| &s.name));

        for name in names {
            validate_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(Error::invalid_directory(format!("Duplicate entry: {name}")));
            }
        }
        Ok(())
    }

    /// Encode the record to its canonical bytes.
    ///
    /// The bytes are the protobuf serialization of the Remote Execution
    /// API `Directory` message, with every list sorted by name, so a digest
    /// computed here matches the one any conforming CAS computes.
    pub fn encode(&self) -> Vec<u8> {
        let mut canonical = self.clone();
        canonical.canonicalize();
        WireDirectory::from(&canonical).encode_to_vec()
    }

    /// Decode a serialized `Directory` message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let wire = WireDirectory::decode(data)
            .map_err(|e| Error::invalid_directory(format!("Malformed directory record: {e}")))?;

        let mut directory = Directory::new();
        for file in wire.files {
            let node_properties = file
                .node_properties
                .map(|p| {
                    p.properties
                        .into_iter()
                        .map(|p| NodeProperty::new(p.name, p.value))
                        .collect()
                })
                .unwrap_or_default();
            directory.files.push(FileNode {
                digest: read_digest(&file.name, file.digest)?,
                name: file.name,
                is_executable: file.is_executable,
                node_properties,
            });
        }
        for dir in wire.directories {
            directory.directories.push(DirectoryNode {
                digest: read_digest(&dir.name, dir.digest)?,
                name: dir.name,
            });
        }
        for link in wire.symlinks {
            directory.symlinks.push(SymlinkNode {
                name: link.name,
                target: link.target,
            });
        }

        directory.validate()?;
        Ok(directory)
    }
}

fn read_digest(name: &str, digest: Option<WireDigest>) -> Result<Digest> {
    let digest = digest
        .ok_or_else(|| Error::invalid_directory(format!("Entry {name} has no digest")))?;
    Digest::validate_hash(&digest.hash)?;
    Ok(Digest::new(digest.hash, digest.size_bytes))
}

// Remote Execution API v2 message layouts. Field numbers must not change.
//
// `size_bytes` is `int64` in the schema. Its varint bytes equal the
// `uint64` encoding of the same bit pattern, so sizes round-trip unchanged.

#[derive(Clone, PartialEq, prost::Message)]
struct WireDigest {
    #[prost(string, tag = "1")]
    hash: String,
    #[prost(uint64, tag = "2")]
    size_bytes: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireNodeProperty {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(string, tag = "2")]
    value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireNodeProperties {
    #[prost(message, repeated, tag = "1")]
    properties: Vec<WireNodeProperty>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireFileNode {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(message, optional, tag = "2")]
    digest: Option<WireDigest>,
    #[prost(bool, tag = "4")]
    is_executable: bool,
    #[prost(message, optional, tag = "6")]
    node_properties: Option<WireNodeProperties>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireDirectoryNode {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(message, optional, tag = "2")]
    digest: Option<WireDigest>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireSymlinkNode {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(string, tag = "2")]
    target: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireDirectory {
    #[prost(message, repeated, tag = "1")]
    files: Vec<WireFileNode>,
    #[prost(message, repeated, tag = "2")]
    directories: Vec<WireDirectoryNode>,
    #[prost(message, repeated, tag = "3")]
    symlinks: Vec<WireSymlinkNode>,
}

impl From<&Digest> for WireDigest {
    fn from(digest: &Digest) -> Self {
        Self {
            hash: digest.hash.clone(),
            size_bytes: digest.size_bytes,
        }
    }
}

impl From<&Directory> for WireDirectory {
    fn from(directory: &Directory) -> Self {
        let files = directory
            .files
            .iter()
            .map(|f| WireFileNode {
                name: f.name.clone(),
                digest: Some(WireDigest::from(&f.digest)),
                is_executable: f.is_executable,
                node_properties: (!f.node_properties.is_empty()).then(|| WireNodeProperties {
                    properties: f
                        .node_properties
                        .iter()
                        .map(|p| WireNodeProperty {
                            name: p.name.clone(),
                            value: p.value.clone(),
                        })
                        .collect(),
                }),
            })
            .collect();
        let directories = directory
            .directories
            .iter()
            .map(|d| WireDirectoryNode {
                name: d.name.clone(),
                digest: Some(WireDigest::from(&d.digest)),
            })
            .collect();
        let symlinks = directory
            .symlinks
            .iter()
            .map(|s| WireSymlinkNode {
                name: s.name.clone(),
                target: s.target.clone(),
            })
            .collect();

        Self {
            files,
            directories,
            symlinks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::DigestGenerator;

    fn digest(content: &[u8]) -> Digest {
        DigestGenerator::default().hash_bytes(content)
    }

    fn sample() -> Directory {
        let mut dir = Directory::new();
        dir.add_file("b.txt", digest(b"b"), false, vec![]).unwrap();
        dir.add_file(
            "a.sh",
            digest(b"#!/bin/sh"),
            true,
            vec![NodeProperty::new("mtime", "1700000000")],
        )
        .unwrap();
        dir.add_directory("sub", digest(b"sub-record")).unwrap();
        dir.add_symlink("link", "a.sh").unwrap();
        dir
    }

    #[test]
    fn test_encode_decode() {
        let dir = sample();
        let decoded = Directory::decode(&dir.encode()).unwrap();

        let mut expected = dir.clone();
        expected.canonicalize();
        assert_eq!(decoded, expected);
        assert_eq!(decoded.files[0].name, "a.sh");
        assert!(decoded.files[0].is_executable);
    }

    #[test]
    fn test_encoding_ignores_insertion_order() {
        let mut forward = Directory::new();
        forward.add_file("a", digest(b"1"), false, vec![]).unwrap();
        forward.add_file("b", digest(b"2"), false, vec![]).unwrap();

        let mut backward = Directory::new();
        backward.add_file("b", digest(b"2"), false, vec![]).unwrap();
        backward.add_file("a", digest(b"1"), false, vec![]).unwrap();

        assert_eq!(forward.encode(), backward.encode());
    }

    #[test]
    fn test_empty_directory() {
        let dir = Directory::new();
        let encoded = dir.encode();
        assert!(encoded.is_empty());
        assert!(Directory::decode(&encoded).unwrap().is_empty());
        assert_eq!(
            DigestGenerator::default().hash_bytes(&encoded).to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/0"
        );
    }

    #[test]
    fn test_wire_bytes() {
        let mut dir = Directory::new();
        dir.add_symlink("l", "a").unwrap();
        dir.add_file("x", Digest::new("ab", 1), true, vec![]).unwrap();
        dir.add_file("a", Digest::new("ab", 1), false, vec![]).unwrap();

        #[rustfmt::skip]
        let expected = [
            // files[0]: name "a", digest {hash "ab", size 1}
            0x0a, 0x0b, 0x0a, 0x01, b'a', 0x12, 0x06, 0x0a, 0x02, b'a', b'b', 0x10, 0x01,
            // files[1]: name "x", digest {hash "ab", size 1}, is_executable
            0x0a, 0x0d, 0x0a, 0x01, b'x', 0x12, 0x06, 0x0a, 0x02, b'a', b'b', 0x10, 0x01,
            0x20, 0x01,
            // symlinks[0]: name "l", target "a"
            0x1a, 0x06, 0x0a, 0x01, b'l', 0x12, 0x01, b'a',
        ];
        assert_eq!(dir.encode(), expected);
    }

    #[test]
    fn test_node_properties_encoded() {
        let mut dir = Directory::new();
        dir.add_file(
            "a",
            Digest::new("ab", 1),
            false,
            vec![NodeProperty::new("k", "v")],
        )
        .unwrap();

        #[rustfmt::skip]
        let expected = [
            0x0a, 0x15, 0x0a, 0x01, b'a', 0x12, 0x06, 0x0a, 0x02, b'a', b'b', 0x10, 0x01,
            // node_properties (field 6) { properties { name "k", value "v" } }
            0x32, 0x08, 0x0a, 0x06, 0x0a, 0x01, b'k', 0x12, 0x01, b'v',
        ];
        assert_eq!(dir.encode(), expected);
        assert_eq!(
            Directory::decode(&expected).unwrap().files[0].node_properties,
            vec![NodeProperty::new("k", "v")]
        );
    }

    #[test]
    fn test_long_fields_roundtrip() {
        let mut dir = Directory::new();
        dir.add_file("big", Digest::new("a".repeat(300), u64::MAX), false, vec![
            NodeProperty::new("p".repeat(70_000), "v".repeat(70_000)),
        ])
        .unwrap();
        dir.add_symlink("far", "t".repeat(100_000)).unwrap();

        let decoded = Directory::decode(&dir.encode()).unwrap();
        assert_eq!(decoded, dir);
        assert_eq!(decoded.files[0].digest.hash.len(), 300);
        assert_eq!(decoded.files[0].digest.size_bytes, u64::MAX);
    }

    #[test]
    fn test_decode_rejects_missing_digest() {
        // files[0]: name "a" and nothing else
        assert!(Directory::decode(&[0x0a, 0x03, 0x0a, 0x01, b'a']).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_hash() {
        // files[0]: name "a", digest {hash "XY", size 1}
        let bytes = [
            0x0a, 0x0b, 0x0a, 0x01, b'a', 0x12, 0x06, 0x0a, 0x02, b'X', b'Y', 0x10, 0x01,
        ];
        assert!(Directory::decode(&bytes).is_err());
    }

    #[test]
    fn test_name_validation() {
        let mut dir = Directory::new();
        assert!(dir.add_file("", digest(b""), false, vec![]).is_err());
        assert!(dir.add_file("a/b", digest(b""), false, vec![]).is_err());
        assert!(dir.add_file("..", digest(b""), false, vec![]).is_err());
        assert!(dir.add_file("nul\0", digest(b""), false, vec![]).is_err());
        assert!(dir.add_file("a".repeat(256), digest(b""), false, vec![]).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut dir = Directory::new();
        dir.add_file("x", digest(b"1"), false, vec![]).unwrap();
        assert!(dir.add_directory("x", digest(b"2")).is_err());
        assert!(dir.add_symlink("x", "y").is_err());
    }

    #[test]
    fn test_entry_lookup() {
        let dir = sample();
        assert!(matches!(dir.entry("a.sh"), Some(Entry::File(_))));
        assert!(matches!(dir.entry("sub"), Some(Entry::Directory(_))));
        assert!(matches!(dir.entry("link"), Some(Entry::Symlink(_))));
        assert!(dir.entry("missing").is_none());
        assert_eq!(
            dir.names().into_iter().collect::<Vec<_>>(),
            vec!["a.sh", "b.txt", "link", "sub"]
        );
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = sample().encode();
        encoded.push(0);
        assert!(Directory::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let encoded = sample().encode();
        assert!(Directory::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    use proptest::prelude::*;

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-][a-zA-Z0-9._-]{0,31}"
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Encoding is independent of entry order.
        #[test]
        fn prop_encoding_order_independent(
            names in prop::collection::btree_set(arb_name(), 0..16),
            contents in prop::collection::vec(any::<u8>(), 16),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let mut forward = Directory::new();
            for (i, name) in names.iter().enumerate() {
                let d = digest(&[contents[i % contents.len()]]);
                forward.add_file(name.clone(), d, i % 2 == 0, vec![])?;
            }

            let mut reversed = forward.clone();
            reversed.files.reverse();

            prop_assert_eq!(forward.encode(), reversed.encode());
            let decoded = Directory::decode(&reversed.encode())?;
            prop_assert_eq!(decoded.files.len(), names.len());
        }
    }
}
