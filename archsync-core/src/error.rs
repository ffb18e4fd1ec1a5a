//! Error types for archsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure other than a missing file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A local file or registry row that the operation needs does not exist.
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    /// No bucket row exists for `(archive, timecode)`.
    #[error("no timecode bucket {timecode} in archive '{archive}'")]
    BucketNotFound { archive: String, timecode: i64 },

    /// Ill-formed arguments; nothing was written.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The SQLite registry rejected the operation or could not be reached.
    #[error("registry database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding of a stored column failed.
    #[error("registry JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database was written by a newer schema than this build understands.
    #[error("registry schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// Another thread panicked while holding the connection.
    #[error("registry connection lock poisoned")]
    Poisoned,

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    /// A field failed validation; `field` names the offending key.
    #[error("invalid config for archive '{archive}': {field}: {reason}")]
    Invalid {
        archive: String,
        field: &'static str,
        reason: String,
    },

    #[error("no worker configured for archive '{0}'")]
    UnknownArchive(String),

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}
