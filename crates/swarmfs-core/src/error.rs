//! Error types for swarmfs
//!
//! Every crate in the workspace returns this error so that callers can
//! distinguish "nothing available" (an `Ok(None)` / empty result) from a
//! genuinely exceptional condition.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for swarmfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Number of leading bytes of an unparseable document kept for diagnostics.
pub const CORRUPT_PREVIEW_BYTES: usize = 120;

/// Main error type for swarmfs
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Contention
    // ==========================================================================
    #[error("Timed out acquiring lock {} after {:.2}s", path.display(), waited.as_secs_f64())]
    LockTimeout { path: PathBuf, waited: Duration },

    // ==========================================================================
    // Data integrity
    // ==========================================================================
    #[error("Corrupt document {} ({len} bytes): {preview:?}", path.display())]
    CorruptDocument {
        path: PathBuf,
        len: usize,
        preview: String,
    },

    // ==========================================================================
    // Input rejection
    // ==========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ==========================================================================
    // Internal Errors
    // ==========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `CorruptDocument` error carrying a short, lossy preview of the
    /// raw bytes that failed to parse.
    #[must_use]
    pub fn corrupt(path: impl Into<PathBuf>, raw: &[u8]) -> Self {
        let head = &raw[..raw.len().min(CORRUPT_PREVIEW_BYTES)];
        Self::CorruptDocument {
            path: path.into(),
            len: raw.len(),
            preview: String::from_utf8_lossy(head).into_owned(),
        }
    }

    /// Returns the error type string (for JSON output and log fields)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::CorruptDocument { .. } => "CORRUPT_DOCUMENT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::UnknownAgent(_) => "UNKNOWN_AGENT",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Lock contention and transient I/O are retried by the components that
    /// own a retry budget; malformed input and corrupt documents never are.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Io(_))
    }
}
