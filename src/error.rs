//! Typed failure kinds. They travel inside `anyhow::Error`, so callers that care
//! about the kind use `err.downcast_ref::<RevertError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RevertError {
    /// Snapshot enumeration failed before anything was mutated.
    #[error("snapshot discovery failed in {dir}: {source}")]
    Discovery {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Requested target snapshot is not in the index (deleted or never existed).
    #[error("snapshot not found: {0}")]
    NotFound(PathBuf),

    /// The platform could not report the block layout of a file.
    #[error("extent query failed for {path}: {reason}")]
    ExtentQueryFailed { path: PathBuf, reason: String },

    #[error("i/o error on {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// Fallible reservation failed while growing an in-memory structure.
    #[error("out of memory while growing {0}")]
    OutOfMemory(&'static str),

    #[error("invalid COW image {path}: {reason}")]
    BadImage { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// External controller command (enable/unmount/fsck) failed.
    #[error("hook `{command}` failed: {reason}")]
    Hook { command: String, reason: String },
}

impl RevertError {
    pub(crate) fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        RevertError::Io {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn extent_query(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RevertError::ExtentQueryFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_image(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RevertError::BadImage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
