//! `archsync status`: copy and finalization progress per archive.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use archsync_core::{ArchiveName, DaemonConfig, Registry};
use archsync_sync::report::format_age;
use archsync_sync::{archive_report_at, ArchiveReport};

use super::{max_copy_attempts, Workspace};

/// Arguments for `archsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only this archive.
    #[arg(long, short = 'a')]
    pub archive: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusJson {
    archives: Vec<ArchiveReport>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "archive")]
    archive: String,
    #[tabled(rename = "files")]
    total: u64,
    #[tabled(rename = "copied")]
    copied: u64,
    #[tabled(rename = "pending")]
    pending: u64,
    #[tabled(rename = "failed")]
    failed: u64,
    #[tabled(rename = "removed")]
    removed: u64,
    #[tabled(rename = "ignored")]
    ignored: u64,
    #[tabled(rename = "finalized")]
    finalized: String,
    #[tabled(rename = "finalized until")]
    finalized_until: String,
}

impl StatusArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;

        let mut names = archive_names(&config, &registry)?;
        if let Some(filter) = self.archive.as_ref() {
            names.retain(|name| name.as_str() == filter);
            if names.is_empty() {
                anyhow::bail!("unknown archive '{filter}'");
            }
        }

        let now = Utc::now();
        let mut reports = Vec::with_capacity(names.len());
        for name in &names {
            let max_attempts = max_copy_attempts(&config, name);
            let report = archive_report_at(&registry, name, max_attempts, now)
                .with_context(|| format!("status query failed for '{name}'"))?;
            reports.push(report);
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&StatusJson { archives: reports })
                    .context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(reports, now);
        Ok(())
    }
}

/// Configured archives plus any that only exist in the registry.
fn archive_names(config: &DaemonConfig, registry: &Registry) -> Result<Vec<ArchiveName>> {
    let mut names: BTreeSet<ArchiveName> = config
        .workers
        .iter()
        .map(|w| w.archive_name.clone())
        .collect();
    names.extend(registry.archives().context("failed to list archives")?);
    Ok(names.into_iter().collect())
}

fn print_table(reports: Vec<ArchiveReport>, now: chrono::DateTime<Utc>) {
    let failed_total: u64 = reports.iter().map(|r| r.stats.permanently_failed).sum();
    println!(
        "archsync v{} | {} archives | {} permanently failed",
        env!("CARGO_PKG_VERSION"),
        reports.len(),
        failed_total,
    );

    if reports.is_empty() {
        println!("No archives configured or registered.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    let failures: Vec<_> = reports
        .iter()
        .flat_map(|r| r.permanently_failed.iter().cloned())
        .collect();

    let rows: Vec<StatusTableRow> = reports
        .into_iter()
        .map(|report| {
            let stats = report.stats;
            StatusTableRow {
                archive: stats.archive_name.to_string(),
                total: stats.total_files,
                copied: stats.copied,
                pending: stats.pending,
                failed: stats.permanently_failed,
                removed: stats.removed,
                ignored: stats.ignored,
                finalized: format!("{}/{}", stats.finalized_buckets, stats.buckets),
                finalized_until: format!("{} ago", format_age(stats.finalized_until, now)),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{separator}");
    println!("{table}");

    if !failures.is_empty() {
        println!("{separator}");
        println!("{}", "PERMANENTLY FAILED".red().bold());
        for path in failures {
            println!("  ✗  {}", path.display());
        }
    }
}
