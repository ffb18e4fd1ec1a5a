//! Per-file inspection: `list`, `next`, `check` and `ignore`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use archsync_core::{ArchiveName, SyncFile};
use archsync_sync::report::format_age;

use super::{absolute, max_copy_attempts, Workspace};

/// Arguments for `archsync list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, short = 'a')]
    pub archive: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `archsync next`.
#[derive(Args, Debug)]
pub struct NextArgs {
    #[arg(long, short = 'a')]
    pub archive: String,
}

/// Arguments for `archsync check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Local path the file was registered under.
    pub local: PathBuf,
}

/// Arguments for `archsync ignore`.
#[derive(Args, Debug)]
pub struct IgnoreArgs {
    /// Local path the file was registered under.
    pub local: PathBuf,

    /// Clear the flag so the worker picks the file up again.
    #[arg(long)]
    pub undo: bool,
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "id")]
    id: i64,
    #[tabled(rename = "local")]
    local: String,
    #[tabled(rename = "remote")]
    remote: String,
    #[tabled(rename = "attempts")]
    attempts: u32,
    #[tabled(rename = "registered")]
    registered: String,
}

impl ListArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let files = copyable(workspace, &self.archive, None)?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&files).context("failed to serialize files")?
            );
            return Ok(());
        }

        if files.is_empty() {
            println!("Nothing left to copy for archive '{}'.", self.archive);
            return Ok(());
        }

        let now = Utc::now();
        let rows: Vec<FileRow> = files
            .iter()
            .map(|file| FileRow {
                id: file.id,
                local: file.local_path.display().to_string(),
                remote: file.remote_path.display().to_string(),
                attempts: file.failed_copy_attempts,
                registered: format!("{} ago", format_age(file.created_at, now)),
            })
            .collect();
        println!("{}", self.archive.to_uppercase().bold());
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

impl NextArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        match copyable(workspace, &self.archive, Some(1))?.into_iter().next() {
            Some(file) => println!(
                "{} → {} ({} failed attempts)",
                file.local_path.display(),
                file.remote_path.display(),
                file.failed_copy_attempts
            ),
            None => println!("Nothing left to copy for archive '{}'.", self.archive),
        }
        Ok(())
    }
}

impl CheckArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;
        let local = absolute(&self.local)?;

        let file = registry
            .get_file(&local)
            .with_context(|| format!("failed to look up '{}'", local.display()))?
            .with_context(|| format!("'{}' is not registered", local.display()))?;
        let max_attempts = max_copy_attempts(&config, &file.archive_name);

        let mut value = serde_json::to_value(&file).context("failed to serialize file")?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "state".to_string(),
                serde_json::Value::String(file.state(max_attempts).to_string()),
            );
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("failed to render file JSON")?
        );
        Ok(())
    }
}

impl IgnoreArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;
        let local = absolute(&self.local)?;

        let file = registry
            .set_ignored(&local, !self.undo)
            .with_context(|| format!("failed to update '{}'", local.display()))?;
        if file.ignored {
            println!("✓ '{}' is now ignored", file.local_path.display());
        } else {
            println!("✓ '{}' is queued again", file.local_path.display());
        }
        Ok(())
    }
}

/// Files the worker of `archive` would pick next, in its order.
fn copyable(workspace: &Workspace, archive: &str, limit: Option<usize>) -> Result<Vec<SyncFile>> {
    let config = workspace.config()?;
    let registry = workspace.registry(&config)?;
    let archive = ArchiveName::from(archive);
    registry
        .copyable_files(&archive, max_copy_attempts(&config, &archive), limit)
        .with_context(|| format!("failed to list files for '{archive}'"))
}
