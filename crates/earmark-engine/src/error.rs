//! Error types for the Earmark offline engine.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the offline engine.
///
/// The taxonomy is deliberately small: transfer and sync failures are
/// expected operating conditions, not exceptional ones, and most of them
/// resolve to "retry on the next opportunity".
#[derive(Debug, Error)]
pub enum Error {
    /// A network call failed in a way that is safe to retry later.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// The remote playback session is no longer valid and must be recreated.
    #[error("remote session invalid: {0}")]
    InvalidSession(String),

    /// A disk write or read failed (out of space, permissions, etc.).
    #[error("local storage failure at {path}: {message}")]
    LocalStorage {
        /// Path where the failure occurred.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The operation was cancelled. A normal terminal state, not a fault.
    #[error("operation cancelled")]
    Cancelled,

    /// No record exists for the given item.
    #[error("no record for item: {0}")]
    RecordNotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::LocalStorage`] from a path and any displayable cause.
    pub fn local_storage(path: impl AsRef<Path>, cause: impl std::fmt::Display) -> Self {
        Self::LocalStorage {
            path: path.as_ref().to_path_buf(),
            message: cause.to_string(),
        }
    }

    /// Whether this error indicates the remote session must be recreated.
    #[must_use]
    pub const fn is_invalid_session(&self) -> bool {
        matches!(self, Self::InvalidSession(_))
    }

    /// Whether this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::TransientNetwork(err.to_string())
    }
}
