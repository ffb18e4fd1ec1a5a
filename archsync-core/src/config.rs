//! Daemon and per-archive worker configuration.
//!
//! ```text
//! ~/.archsync/
//!   config.yaml     (DaemonConfig: registry path + one entry per archive)
//! ```
//!
//! Path-taking functions come in `_at(home, …)` / plain pairs like the
//! registry helpers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry;
use crate::types::{ArchiveName, WorkerId};

/// `<home>/.archsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".archsync").join("config.yaml")
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_path_at(&home()?))
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Upper bound for `delete_local_after_secs` (100 years).
pub const MAX_DELETE_AFTER_SECS: u64 = 100 * 365 * 24 * 60 * 60;
/// Upper bound for the timeouts and the loop interval (one year).
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;
pub const MAX_COPY_CONCURRENCY: usize = 1024;
pub const MAX_FILES_PER_BATCH: usize = 1_000_000;

/// Policy for the single worker that owns one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub archive_name: ArchiveName,
    /// Absolute destination root; remote paths are joined onto it.
    pub remote_base_dir: PathBuf,
    /// `None` copies into a locally mounted `remote_base_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,
    /// Where finalization records are written before being registered.
    pub finalization_root: PathBuf,
    pub worker_id: WorkerId,
    /// `None` keeps local copies forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_local_after_secs: Option<u64>,
    #[serde(default = "default_max_copy_attempts")]
    pub max_copy_attempts: u32,
    #[serde(default = "default_copy_timeout_secs")]
    pub copy_timeout_secs: u64,
    #[serde(default = "default_cmd_timeout_secs")]
    pub cmd_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_per_batch: Option<usize>,
    #[serde(default = "default_copy_concurrency")]
    pub copy_concurrency: usize,
    #[serde(default = "default_sleep_time_secs")]
    pub sleep_time_secs: u64,
    #[serde(default)]
    pub compression: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bwlimit: Option<String>,
    /// A bucket older than this many timecodes counts as complete even with
    /// no newer files.
    #[serde(default = "default_complete_after_timecodes")]
    pub complete_after_timecodes: i64,
}

fn default_max_copy_attempts() -> u32 {
    5
}
fn default_copy_timeout_secs() -> u64 {
    300
}
fn default_cmd_timeout_secs() -> u64 {
    60
}
fn default_copy_concurrency() -> usize {
    1
}
fn default_sleep_time_secs() -> u64 {
    60
}
fn default_complete_after_timecodes() -> i64 {
    1
}

impl WorkerConfig {
    /// Minimal config with every tunable at its default.
    pub fn new(
        archive_name: impl Into<ArchiveName>,
        remote_base_dir: impl Into<PathBuf>,
        finalization_root: impl Into<PathBuf>,
        worker_id: impl Into<WorkerId>,
    ) -> Self {
        Self {
            archive_name: archive_name.into(),
            remote_base_dir: remote_base_dir.into(),
            remote_host: None,
            ssh_key: None,
            finalization_root: finalization_root.into(),
            worker_id: worker_id.into(),
            delete_local_after_secs: None,
            max_copy_attempts: default_max_copy_attempts(),
            copy_timeout_secs: default_copy_timeout_secs(),
            cmd_timeout_secs: default_cmd_timeout_secs(),
            files_per_batch: None,
            copy_concurrency: default_copy_concurrency(),
            sleep_time_secs: default_sleep_time_secs(),
            compression: false,
            bwlimit: None,
            complete_after_timecodes: default_complete_after_timecodes(),
        }
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.cmd_timeout_secs)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    /// `None` when deletion is off or the value does not fit a `TimeDelta`.
    pub fn delete_local_after(&self) -> Option<TimeDelta> {
        self.delete_local_after_secs
            .and_then(|s| i64::try_from(s).ok())
            .and_then(TimeDelta::try_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid {
            archive: self.archive_name.0.clone(),
            field,
            reason,
        };

        self.archive_name
            .validate()
            .map_err(|r| invalid("archive_name", r))?;
        if self.worker_id.0.trim().is_empty() {
            return Err(invalid("worker_id", "must not be empty".to_string()));
        }
        if self.worker_id.0.contains(['/', '\\']) {
            return Err(invalid(
                "worker_id",
                "must not contain path separators".to_string(),
            ));
        }
        if !self.remote_base_dir.is_absolute() {
            return Err(invalid(
                "remote_base_dir",
                format!("must be absolute: {}", self.remote_base_dir.display()),
            ));
        }
        if !self.finalization_root.is_absolute() {
            return Err(invalid(
                "finalization_root",
                format!("must be absolute: {}", self.finalization_root.display()),
            ));
        }

        if self.max_copy_attempts == 0 {
            return Err(invalid(
                "max_copy_attempts",
                "must be greater than zero".to_string(),
            ));
        }
        let intervals: [(&'static str, u64); 3] = [
            ("copy_timeout_secs", self.copy_timeout_secs),
            ("cmd_timeout_secs", self.cmd_timeout_secs),
            ("sleep_time_secs", self.sleep_time_secs),
        ];
        for (field, value) in intervals {
            check_range(value, 1, MAX_INTERVAL_SECS).map_err(|r| invalid(field, r))?;
        }
        check_range(self.copy_concurrency as u64, 1, MAX_COPY_CONCURRENCY as u64)
            .map_err(|r| invalid("copy_concurrency", r))?;
        if let Some(batch) = self.files_per_batch {
            check_range(batch as u64, 1, MAX_FILES_PER_BATCH as u64)
                .map_err(|r| invalid("files_per_batch", r))?;
        }
        if self.complete_after_timecodes < 1 {
            return Err(invalid(
                "complete_after_timecodes",
                "must be at least 1".to_string(),
            ));
        }
        if let Some(secs) = self.delete_local_after_secs {
            check_range(secs, 0, MAX_DELETE_AFTER_SECS)
                .map_err(|r| invalid("delete_local_after_secs", r))?;
        }
        Ok(())
    }
}

fn check_range(value: u64, min: u64, max: u64) -> Result<(), String> {
    if value < min {
        return Err(format!("must be at least {min}"));
    }
    if value > max {
        return Err(format!("must be at most {max}, got {value}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Registry database; defaults to `<home>/.archsync/registry.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl DaemonConfig {
    /// Load and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: DaemonConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<home>/.archsync/config.yaml`.
    pub fn load_at(home: &Path) -> Result<Self, ConfigError> {
        Self::load(&config_path_at(home))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for worker in &self.workers {
            worker.validate()?;
            if !seen.insert(worker.archive_name.clone()) {
                return Err(ConfigError::Invalid {
                    archive: worker.archive_name.0.clone(),
                    field: "archive_name",
                    reason: "configured more than once".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Explicit `db_path`, else the default under `home`.
    pub fn db_path_at(&self, home: &Path) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| registry::db_path_at(home))
    }

    pub fn worker(&self, archive: &ArchiveName) -> Result<&WorkerConfig, ConfigError> {
        self.workers
            .iter()
            .find(|w| &w.archive_name == archive)
            .ok_or_else(|| ConfigError::UnknownArchive(archive.0.clone()))
    }
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
