//! Merging two independently rooted Merkle trees.
//!
//! Entries present on one side only are copied. Entries present on both
//! sides must agree, except for subdirectories, which are merged
//! recursively. The first disagreement stops the merge and is reported as a
//! [`Collision`].
//!
//! Directory records are read from an explicit [`DirectoryArena`]; every
//! record synthesized by the merge that did not already exist on either
//! side is returned alongside the new root so the caller can upload it.

use crate::digest::{Digest, DigestBlobMap};
use crate::directory::{Directory, Entry};
use crate::error::{Error, Result};
use crate::hash::DigestGenerator;
use crate::remote::CasClient;
use crate::retry::RetryPolicy;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Directory records by digest.
pub type DirectoryArena = HashMap<Digest, Directory>;

/// One side of a collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryRef {
    File { digest: Digest, is_executable: bool },
    Directory { digest: Digest },
    Symlink { target: String },
}

impl From<Entry<'_>> for EntryRef {
    fn from(entry: Entry<'_>) -> Self {
        match entry {
            Entry::File(f) => EntryRef::File {
                digest: f.digest.clone(),
                is_executable: f.is_executable,
            },
            Entry::Directory(d) => EntryRef::Directory {
                digest: d.digest.clone(),
            },
            Entry::Symlink(s) => EntryRef::Symlink {
                target: s.target.clone(),
            },
        }
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRef::File { digest, .. } => write!(f, "file {digest}"),
            EntryRef::Directory { digest } => write!(f, "directory {digest}"),
            EntryRef::Symlink { target } => write!(f, "symlink -> {target}"),
        }
    }
}

/// The first path at which the two trees disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    /// Path of the entry relative to the roots.
    pub path: PathBuf,
    pub input: EntryRef,
    pub template: EntryRef,
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: input has {}, template has {}",
            self.path.display(),
            self.input,
            self.template
        )
    }
}

/// A successfully merged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedTree {
    pub root: Digest,
    /// Serialized records created by the merge; `None` unless requested.
    pub new_digests: Option<DigestBlobMap>,
}

/// Result of [`create_merged_digest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(MergedTree),
    Collided(Collision),
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MergeOutcome::Merged(_))
    }

    /// Merged root digest, if the merge succeeded.
    pub fn root(&self) -> Option<&Digest> {
        match self {
            MergeOutcome::Merged(tree) => Some(&tree.root),
            MergeOutcome::Collided(_) => None,
        }
    }
}

/// Outcome of merging one pair of directories.
enum Step {
    Merged { digest: Digest, new: DigestBlobMap },
    Collided(Collision),
}

/// Merge the trees under `input_root` and `template_root`.
///
/// A `None` root stands for an empty tree. When `collect_new` is set, the
/// outcome carries every synthesized record whose digest exists in neither
/// input. Fails only when a referenced directory is missing from `arena`.
pub fn create_merged_digest(
    generator: &DigestGenerator,
    arena: &DirectoryArena,
    input_root: Option<&Digest>,
    template_root: Option<&Digest>,
    collect_new: bool,
) -> Result<MergeOutcome> {
    let (root, new) = match (input_root, template_root) {
        (None, None) => {
            let (digest, bytes) = generator.encode_directory(&Directory::new());
            let new = HashMap::from([(digest.clone(), bytes)]);
            (digest, new)
        }
        (Some(root), None) | (None, Some(root)) => (root.clone(), HashMap::new()),
        (Some(input), Some(template)) if input == template => (input.clone(), HashMap::new()),
        (Some(input), Some(template)) => {
            match merge_directories(generator, arena, input, template, Path::new(""))? {
                Step::Merged { digest, new } => (digest, new),
                Step::Collided(collision) => {
                    tracing::warn!(
                        path = %collision.path.display(),
                        input = %collision.input,
                        template = %collision.template,
                        "merge collision"
                    );
                    return Ok(MergeOutcome::Collided(collision));
                }
            }
        }
    };

    tracing::debug!(root = %root.short(), new = new.len(), "merged trees");
    Ok(MergeOutcome::Merged(MergedTree {
        root,
        new_digests: collect_new.then_some(new),
    }))
}

fn lookup<'a>(arena: &'a DirectoryArena, digest: &Digest) -> Result<&'a Directory> {
    arena
        .get(digest)
        .ok_or_else(|| Error::object_not_found(digest.to_string()))
}

fn copy_entry(into: &mut Directory, name: &str, entry: Entry<'_>) -> Result<()> {
    match entry {
        Entry::File(f) => into.add_file(
            name,
            f.digest.clone(),
            f.is_executable,
            f.node_properties.clone(),
        ),
        Entry::Directory(d) => into.add_directory(name, d.digest.clone()),
        Entry::Symlink(s) => into.add_symlink(name, s.target.clone()),
    }
}

fn merge_directories(
    generator: &DigestGenerator,
    arena: &DirectoryArena,
    input_digest: &Digest,
    template_digest: &Digest,
    prefix: &Path,
) -> Result<Step> {
    let input = lookup(arena, input_digest)?;
    let template = lookup(arena, template_digest)?;

    let mut merged = Directory::new();
    let mut new = DigestBlobMap::new();

    let names: BTreeSet<&str> = input.names().union(&template.names()).copied().collect();
    for name in names {
        let (a, b) = match (input.entry(name), template.entry(name)) {
            (Some(entry), None) | (None, Some(entry)) => {
                copy_entry(&mut merged, name, entry)?;
                continue;
            }
            (Some(a), Some(b)) => (a, b),
            (None, None) => continue,
        };

        match (a, b) {
            (Entry::File(x), Entry::File(y)) if x.digest == y.digest => {
                copy_entry(&mut merged, name, a)?;
            }
            (Entry::Symlink(x), Entry::Symlink(y)) if x.target == y.target => {
                copy_entry(&mut merged, name, a)?;
            }
            (Entry::Directory(x), Entry::Directory(y)) if x.digest == y.digest => {
                copy_entry(&mut merged, name, a)?;
            }
            (Entry::Directory(x), Entry::Directory(y)) => {
                match merge_directories(generator, arena, &x.digest, &y.digest, &prefix.join(name))? {
                    Step::Merged {
                        digest,
                        new: child_new,
                    } => {
                        new.extend(child_new);
                        merged.add_directory(name, digest)?;
                    }
                    collided @ Step::Collided(_) => return Ok(collided),
                }
            }
            _ => {
                return Ok(Step::Collided(Collision {
                    path: prefix.join(name),
                    input: a.into(),
                    template: b.into(),
                }));
            }
        }
    }

    let (digest, bytes) = generator.encode_directory(&merged);
    if digest != *input_digest && digest != *template_digest {
        new.insert(digest.clone(), bytes);
    }
    Ok(Step::Merged { digest, new })
}

/// Fetch every directory record reachable from `roots`.
pub fn load_arena<'d, C, I>(client: &C, policy: &RetryPolicy, roots: I) -> Result<DirectoryArena>
where
    C: CasClient,
    I: IntoIterator<Item = &'d Digest>,
{
    let mut arena = DirectoryArena::new();
    let mut pending: Vec<Digest> = roots.into_iter().cloned().collect();

    while let Some(digest) = pending.pop() {
        if arena.contains_key(&digest) {
            continue;
        }
        let bytes = policy.run("read_blob", |ctx| client.read_blob(ctx, &digest))?;
        let directory = Directory::decode(&bytes)?;
        pending.extend(directory.directories.iter().map(|d| d.digest.clone()));
        arena.insert(digest, directory);
    }

    Ok(arena)
}

/// Upload the records in `new_digests` that the CAS does not hold yet.
///
/// Returns how many were uploaded.
pub fn upload_new_digests<C: CasClient>(
    client: &C,
    policy: &RetryPolicy,
    new_digests: &DigestBlobMap,
) -> Result<usize> {
    if new_digests.is_empty() {
        return Ok(0);
    }

    let digests: Vec<Digest> = new_digests.keys().cloned().collect();
    let missing = policy.run("find_missing_blobs", |ctx| {
        client.find_missing_blobs(ctx, &digests)
    })?;

    for digest in &missing {
        if let Some(bytes) = new_digests.get(digest) {
            policy.run("write_blob", |ctx| client.write_blob(ctx, digest, bytes))?;
        }
    }

    Ok(missing.len())
}
