//! # casstage core
//!
//! Client-side building blocks for a content-addressable storage (CAS)
//! service as used by remote build and execution tools.
//!
//! Every object, file blob or directory listing, is addressed by a digest of
//! its content. Directory listings reference their children by digest, so a
//! whole tree is a Merkle tree identified by its root digest.
//!
//! ## Features
//!
//! - Digest generation over buffers, files and streams (SHA-256, SHA-1, BLAKE3)
//! - Bounded retry with exponential backoff around every remote call
//! - Staged directories: a CAS tree materialized on disk, with capture of
//!   the outputs a command leaves behind, either directly or through a broker
//! - Merging two Merkle trees into one, with collision reporting
//! - An on-disk store and broker implementing the transport traits
//!
//! ## Example
//!
//! ```no_run
//! use casstage_core::{
//!     ActionResult, HashFunction, LocalCas, OutputSpec, RetryPolicy, StagedDirectory, Stager,
//!     Uploader,
//! };
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cas = LocalCas::open_or_init("./store", HashFunction::Sha256)?;
//! let policy = RetryPolicy::default();
//! let root = Uploader::new(&cas, cas.generator(), &policy).upload_directory(Path::new("./inputs"), &[])?;
//!
//! let stager = Stager::new(&cas, "/tmp/casstage").with_generator(cas.generator());
//! let staged = stager.stage(&root)?;
//!
//! // ... run a command inside staged.path() ...
//!
//! let mut result = ActionResult::default();
//! staged.capture_all_outputs(&OutputSpec::new("").with_file("out.txt"), &mut result)?;
//! println!("{} outputs captured", result.output_files.len());
//! # Ok(())
//! # }
//! ```

mod action;
mod broker;
mod brokered;
pub mod config;
mod defer;
mod digest;
mod directory;
mod error;
mod fallback;
mod hash;
mod materialize;
mod merge;
mod object;
mod remote;
mod retry;
mod staging;
mod store;
mod walk;

pub use action::{ActionResult, OutputDirectory, OutputFile, OutputSpec};
pub use broker::LocalBroker;
pub use brokered::BrokerStagedDirectory;
pub use config::Config;
pub use defer::{Deferred, run_logged};
pub use digest::{Digest, DigestBlobMap};
pub use directory::{Directory, DirectoryNode, Entry, FileNode, NodeProperty, SymlinkNode};
pub use error::{Error, Result};
pub use fallback::FallbackStagedDirectory;
pub use hash::{CHUNK_SIZE, DigestGenerator, HashFunction, HashingContext};
pub use materialize::{MaterializeStats, Materializer};
pub use merge::{
    Collision, DirectoryArena, EntryRef, MergeOutcome, MergedTree, create_merged_digest,
    load_arena, upload_new_digests,
};
pub use object::{CompressionType, ObjectHeader};
pub use remote::{
    Broker, CallContext, CaptureFilesResponse, CaptureTreeResponse, CapturedFile, CapturedTree,
    CasClient, Code, Status, StatusResult,
};
pub use retry::{RetryPolicy, backoff_delay, retry};
pub use staging::{StagedDirectory, Stager, StagingStrategy};
pub use store::LocalCas;
pub use walk::Uploader;
