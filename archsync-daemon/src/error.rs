use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime and its socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry error: {0}")]
    Registry(#[from] archsync_core::RegistryError),

    #[error("config error: {0}")]
    Config(#[from] archsync_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] archsync_sync::SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon answered with a rejection.
    #[error("daemon rejected request: {0}")]
    Rejected(String),

    #[error("{task} task failed: {reason}")]
    Task { task: String, reason: String },

    #[error("another daemon is already listening on {socket}")]
    AlreadyRunning { socket: PathBuf },

    #[error("no worker running for archive '{0}'")]
    UnknownArchive(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
