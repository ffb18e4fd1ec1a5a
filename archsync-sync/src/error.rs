//! Error types for archsync-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use archsync_core::{ConfigError, RegistryError};

/// Failure of a single Transfer Client call. Always transient from the
/// worker's point of view: counted against the file's attempt budget.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transfer program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The transfer program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: String,
        stderr: String,
    },

    /// The remote side answered with something that is not a digest.
    #[error("unparsable remote checksum output: {0:?}")]
    BadChecksum(String),

    /// Raised by the worker when a call outlives its deadline.
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl TransferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }
}

/// All errors that can abort a worker iteration or a tracker pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Finalization record serialization.
    #[error("finalization record YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A copy or blocking registry task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Join(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn transfer_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.into(),
        source,
    }
}
