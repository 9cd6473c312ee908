//! Error types shared across the sync, build and session layers.

use std::path::PathBuf;
use std::time::Duration;

use crate::build::BuildMode;

/// Classification of a per-file failure inside a sync pass.
///
/// These never abort a pass; they travel inside `FileOutcome::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    NotFound,
    PermissionDenied,
    Io,
}

impl From<std::io::ErrorKind> for FileErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => FileErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => FileErrorKind::PermissionDenied,
            _ => FileErrorKind::Io,
        }
    }
}

/// A per-file failure with a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[error("{kind:?}: {message}")]
pub struct FileError {
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    pub fn from_io(context: &str, path: &std::path::Path, err: &std::io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: format!("{} {}: {}", context, path.display(), err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("conversion pool is shutting down")]
    ShuttingDown,

    #[error("conversion task was cancelled before completion")]
    Cancelled,

    #[error("conversion pool channel disconnected")]
    Disconnected,

    #[error("failed to spawn conversion worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source directory does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("sync I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("sync interrupted; pending conversions were cancelled")]
    Interrupted,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The external compile/link step failed. `stderr` is the tool output verbatim.
    #[error("library rebuild failed for {mode}:\n{stderr}")]
    RebuildFailure { mode: BuildMode, stderr: String },

    #[error("required tool not found: {0}")]
    ToolNotFound(PathBuf),

    #[error("build I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("build configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required setting {var} is missing")]
    Missing { var: &'static str },

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("lease window {lease:?} leaves no safe GC grace window (grace would be {grace:?})")]
    LeaseWindow { lease: Duration, grace: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error("source directory {path} does not exist")]
    SourceNotFound { path: PathBuf },

    #[error("{marker} not found in {path}")]
    MarkerMissing { marker: &'static str, path: PathBuf },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
