pub mod add;
pub mod buckets;
pub mod daemon;
pub mod files;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use archsync_core::config::config_path_at;
use archsync_core::{ArchiveName, DaemonConfig, Registry};

/// Attempts assumed for archives present in the registry but not configured.
const UNCONFIGURED_MAX_ATTEMPTS: u32 = 5;

/// Home directory plus the config file every command resolves against.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub home: PathBuf,
    pub config_path: PathBuf,
    /// `--config` was given, so a missing file is an error.
    explicit: bool,
}

impl Workspace {
    pub fn discover(config: Option<PathBuf>) -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let explicit = config.is_some();
        let config_path = config.unwrap_or_else(|| config_path_at(&home));
        Ok(Self {
            home,
            config_path,
            explicit,
        })
    }

    /// The config file, or an empty config when the default file is absent.
    pub fn config(&self) -> Result<DaemonConfig> {
        if !self.explicit && !self.config_path.exists() {
            return Ok(DaemonConfig {
                db_path: None,
                workers: Vec::new(),
            });
        }
        DaemonConfig::load(&self.config_path)
            .with_context(|| format!("failed to load config {}", self.config_path.display()))
    }

    /// Like [`Workspace::config`], but at least one worker must be configured.
    pub fn require_config(&self) -> Result<DaemonConfig> {
        let config = self.config()?;
        if config.workers.is_empty() {
            anyhow::bail!(
                "no archives configured; add workers to {}",
                self.config_path.display()
            );
        }
        Ok(config)
    }

    pub fn registry(&self, config: &DaemonConfig) -> Result<Registry> {
        let path = config.db_path_at(&self.home);
        Registry::open_at(&path)
            .with_context(|| format!("failed to open registry {}", path.display()))
    }
}

/// Absolute form of `path` without requiring it to exist.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    Ok(cwd.join(path))
}

/// Attempt limit of `archive`'s worker, or the default for unconfigured ones.
pub fn max_copy_attempts(config: &DaemonConfig, archive: &ArchiveName) -> u32 {
    config
        .worker(archive)
        .map(|w| w.max_copy_attempts)
        .unwrap_or(UNCONFIGURED_MAX_ATTEMPTS)
}
