//! The remote-call surface: status codes, per-attempt call context, and the
//! transport traits the staging and merge layers call through.
//!
//! Channel construction, authentication and wire serialization belong to
//! whoever implements [`CasClient`] and [`Broker`]. This crate ships one
//! on-disk implementation of each: [`crate::LocalCas`] and
//! [`crate::LocalBroker`].

use crate::digest::Digest;
use crate::directory::NodeProperty;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Canonical status codes of the remote-call surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    /// Upper-case wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one remote call: a code plus the server's message, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Result of a single remote call.
pub type StatusResult<T> = std::result::Result<T, Status>;

/// Per-attempt call context, populated by a metadata attacher before each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Request headers.
    pub metadata: BTreeMap<String, String>,
    /// Deadline for this attempt; enforced by the transport.
    pub deadline: Option<Duration>,
    /// Zero-based index of the attempt this context belongs to.
    pub attempt: u32,
}

impl CallContext {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            ..Self::default()
        }
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = Some(deadline);
    }
}

/// Primitive blob operations of a CAS service.
pub trait CasClient {
    /// Return the subset of `digests` the service does not hold.
    fn find_missing_blobs(
        &self,
        ctx: &mut CallContext,
        digests: &[Digest],
    ) -> StatusResult<Vec<Digest>>;

    /// Fetch one blob.
    fn read_blob(&self, ctx: &mut CallContext, digest: &Digest) -> StatusResult<Vec<u8>>;

    /// Upload one blob under the given digest.
    fn write_blob(&self, ctx: &mut CallContext, digest: &Digest, data: &[u8]) -> StatusResult<()>;
}

impl<T: CasClient + ?Sized> CasClient for &T {
    fn find_missing_blobs(
        &self,
        ctx: &mut CallContext,
        digests: &[Digest],
    ) -> StatusResult<Vec<Digest>> {
        (**self).find_missing_blobs(ctx, digests)
    }

    fn read_blob(&self, ctx: &mut CallContext, digest: &Digest) -> StatusResult<Vec<u8>> {
        (**self).read_blob(ctx, digest)
    }

    fn write_blob(&self, ctx: &mut CallContext, digest: &Digest, data: &[u8]) -> StatusResult<()> {
        (**self).write_blob(ctx, digest, data)
    }
}

/// One file captured by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFile {
    pub path: PathBuf,
    pub digest: Option<Digest>,
    pub is_executable: bool,
    pub node_properties: Vec<NodeProperty>,
    pub status: Status,
}

/// Response to [`Broker::capture_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureFilesResponse {
    pub responses: Vec<CapturedFile>,
}

/// One directory tree captured by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTree {
    pub path: PathBuf,
    /// Digest of the root `Directory` record of the captured subtree.
    pub tree_digest: Option<Digest>,
    pub status: Status,
}

/// Response to [`Broker::capture_tree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureTreeResponse {
    pub responses: Vec<CapturedTree>,
}

/// A trusted local caching proxy that stages and captures on the client's behalf.
pub trait Broker {
    /// Materialize the tree under `root` and return the path it lives at.
    fn stage_tree(
        &self,
        ctx: &mut CallContext,
        root: &Digest,
        path: Option<&Path>,
    ) -> StatusResult<PathBuf>;

    /// Release a previously staged tree.
    fn unstage_tree(&self, ctx: &mut CallContext, root: &Digest, path: &Path) -> StatusResult<()>;

    /// Hash and upload the given files.
    fn capture_files(
        &self,
        ctx: &mut CallContext,
        root: &Path,
        paths: &[PathBuf],
        node_properties: &[NodeProperty],
    ) -> StatusResult<CaptureFilesResponse>;

    /// Hash and upload the given directory trees.
    fn capture_tree(
        &self,
        ctx: &mut CallContext,
        root: &Path,
        paths: &[PathBuf],
        node_properties: &[NodeProperty],
    ) -> StatusResult<CaptureTreeResponse>;
}

impl<T: Broker + ?Sized> Broker for &T {
    fn stage_tree(
        &self,
        ctx: &mut CallContext,
        root: &Digest,
        path: Option<&Path>,
    ) -> StatusResult<PathBuf> {
        (**self).stage_tree(ctx, root, path)
    }

    fn unstage_tree(&self, ctx: &mut CallContext, root: &Digest, path: &Path) -> StatusResult<()> {
        (**self).unstage_tree(ctx, root, path)
    }

    fn capture_files(
        &self,
        ctx: &mut CallContext,
        root: &Path,
        paths: &[PathBuf],
        node_properties: &[NodeProperty],
    ) -> StatusResult<CaptureFilesResponse> {
        (**self).capture_files(ctx, root, paths, node_properties)
    }

    fn capture_tree(
        &self,
        ctx: &mut CallContext,
        root: &Path,
        paths: &[PathBuf],
        node_properties: &[NodeProperty],
    ) -> StatusResult<CaptureTreeResponse> {
        (**self).capture_tree(ctx, root, paths, node_properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::ok().to_string(), "OK");
        assert_eq!(
            Status::unavailable("backend down").to_string(),
            "UNAVAILABLE: backend down"
        );
    }

    #[test]
    fn test_call_context() {
        let mut ctx = CallContext::new(2);
        ctx.insert_metadata("x-request-id", "abc");
        ctx.set_deadline(Duration::from_secs(5));

        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.metadata["x-request-id"], "abc");
        assert_eq!(ctx.deadline, Some(Duration::from_secs(5)));
    }
}
