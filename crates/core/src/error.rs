//! Error taxonomy for the trajectory pipeline.
//!
//! None of these are fatal to a batch: the pipeline logs them and records a
//! skip reason for the offending file or item.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading or converting trajectories.
#[derive(Debug, Error)]
pub enum Error {
    /// The file could not be read or its payload could not be decoded.
    #[error("failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The payload decoded, but holds no extractable trajectory or task info.
    #[error("unrecognized container in {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// A call to an external captioning or completion model failed.
    #[error("external call failed: {0}")]
    ExternalCall(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
