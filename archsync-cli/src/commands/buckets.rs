//! `archsync buckets --archive <name>`

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use archsync_core::{ArchiveName, BucketPhase};
use archsync_sync::report::format_age;

use super::Workspace;

#[derive(Args, Debug)]
pub struct BucketsArgs {
    #[arg(long, short = 'a')]
    pub archive: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "timecode")]
    timecode: String,
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "files")]
    files: String,
    #[tabled(rename = "finalized")]
    finalized: String,
}

impl BucketsArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;
        let archive = ArchiveName::from(self.archive.as_str());

        let buckets = registry
            .buckets(&archive)
            .with_context(|| format!("failed to list buckets for '{archive}'"))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&buckets).context("failed to serialize buckets")?
            );
            return Ok(());
        }

        if buckets.is_empty() {
            println!("No buckets for archive '{archive}'.");
            return Ok(());
        }

        let now = Utc::now();
        let rows: Vec<BucketRow> = buckets
            .iter()
            .map(|bucket| {
                let phase = bucket.phase();
                BucketRow {
                    timecode: bucket.timecode.to_string(),
                    phase: phase_label(phase),
                    // The stored count is only written at finalization.
                    files: if bucket.finalized {
                        bucket.file_count.to_string()
                    } else {
                        "-".to_string()
                    },
                    finalized: bucket
                        .finalized_at
                        .map(|at| format!("{} ago", format_age(at, now)))
                        .unwrap_or_else(|| "-".to_string()),
                }
            })
            .collect();

        println!("{}", archive.to_string().to_uppercase().bold());
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn phase_label(phase: BucketPhase) -> String {
    let label = phase.to_string();
    match phase {
        BucketPhase::Open => label.bright_black().to_string(),
        BucketPhase::AwaitingSync => label.yellow().to_string(),
        BucketPhase::ReadyToFinalize => label.cyan().to_string(),
        BucketPhase::Finalized => label.green().to_string(),
    }
}
