//! Error types for casstage_core.

use crate::remote::{Code, Status};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using casstage_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while hashing, staging, capturing or merging.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during local file operations. Never retried.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A remote call failed with a status outside the retryable set.
    #[error("Remote call failed: {status}")]
    Remote { status: Status },

    /// A remote call kept failing with a retryable status.
    #[error("Retry limit exceeded after {attempts} attempts: {status}")]
    RetryLimitExceeded { attempts: u32, status: Status },

    /// The broker reported a failure for one captured path.
    #[error("Failed to capture {path}: {code}: {message}")]
    Capture {
        path: PathBuf,
        code: Code,
        message: String,
    },

    /// The broker answered a capture call with no entries at all.
    #[error("Empty capture response for {path}")]
    EmptyCaptureResponse { path: PathBuf },

    /// Object file is corrupted or invalid.
    #[error("Corrupted object at {path}: {reason}")]
    CorruptedObject { path: PathBuf, reason: String },

    /// Invalid digest format or encoding.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// Object not found in the store or arena.
    #[error("Object not found: {digest}")]
    ObjectNotFound { digest: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Directory record could not be built or decoded.
    #[error("Invalid directory: {reason}")]
    InvalidDirectory { reason: String },

    /// Path already exists (for staging into a fixed destination).
    #[error("Path already exists: {path}")]
    PathExists { path: PathBuf },

    /// Unsupported digest function.
    #[error("Unsupported hash function: {name}")]
    UnsupportedHashFunction { name: String },

    /// Configuration file could not be parsed or holds bad values.
    #[error("Invalid config at {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    /// A tree could not be staged or a staged path was misused.
    #[error("Staging failed: {reason}")]
    StagingFailed { reason: String },
}

impl Error {
    /// Create a Remote error.
    pub fn remote(status: Status) -> Self {
        Error::Remote { status }
    }

    /// Create a RetryLimitExceeded error.
    pub fn retry_limit_exceeded(attempts: u32, status: Status) -> Self {
        Error::RetryLimitExceeded { attempts, status }
    }

    /// Create a Capture error from a per-item broker status.
    pub fn capture(path: impl Into<PathBuf>, status: &Status) -> Self {
        Error::Capture {
            path: path.into(),
            code: status.code,
            message: status.message.clone(),
        }
    }

    /// Create an EmptyCaptureResponse error.
    pub fn empty_capture_response(path: impl Into<PathBuf>) -> Self {
        Error::EmptyCaptureResponse { path: path.into() }
    }

    /// Create a CorruptedObject error.
    pub fn corrupted_object(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(digest: impl Into<String>) -> Self {
        Error::ObjectNotFound {
            digest: digest.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidDirectory error.
    pub fn invalid_directory(reason: impl Into<String>) -> Self {
        Error::InvalidDirectory {
            reason: reason.into(),
        }
    }

    /// Create a PathExists error.
    pub fn path_exists(path: impl Into<PathBuf>) -> Self {
        Error::PathExists { path: path.into() }
    }

    /// Create an UnsupportedHashFunction error.
    pub fn unsupported_hash_function(name: impl Into<String>) -> Self {
        Error::UnsupportedHashFunction { name: name.into() }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a StagingFailed error.
    pub fn staging_failed(reason: impl Into<String>) -> Self {
        Error::StagingFailed {
            reason: reason.into(),
        }
    }

    /// The remote status carried by this error, if any.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Error::Remote { status } | Error::RetryLimitExceeded { status, .. } => Some(status),
            _ => None,
        }
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
