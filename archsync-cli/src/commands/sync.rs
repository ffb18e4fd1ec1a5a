//! `archsync sync`: one foreground iteration per selected archive.

use anyhow::{Context, Result};
use clap::Args;

use archsync_core::{ArchiveName, WorkerConfig};
use archsync_sync::{transfer, IterationReport, SyncWorker};

use super::Workspace;

/// Arguments for `archsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Archive to sync; every configured archive when omitted.
    #[arg(long, short = 'a')]
    pub archive: Option<String>,
}

impl SyncArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.require_config()?;
        let workers: Vec<WorkerConfig> = match self.archive.as_deref() {
            Some(name) => vec![config
                .worker(&ArchiveName::from(name))
                .context("archive is not configured")?
                .clone()],
            None => config.workers.clone(),
        };
        let registry = workspace.registry(&config)?;
        archsync_daemon::init_tracing(archsync_daemon::LogFormat::Text);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        for worker_config in workers {
            let archive = worker_config.archive_name.clone();
            let transfer = transfer::for_config(&worker_config);
            let mut worker = SyncWorker::new(registry.clone(), worker_config, transfer);
            let report = runtime
                .block_on(worker.run_iteration())
                .with_context(|| format!("sync iteration failed for '{archive}'"))?;
            print_report(&archive, &report);
        }
        Ok(())
    }
}

fn print_report(archive: &ArchiveName, report: &IterationReport) {
    println!(
        "✓ '{archive}' ({} attempted, {} copied, {} failed, {} removed)",
        report.attempted, report.copied, report.failed, report.removed
    );
    if report.timeouts > 0 {
        println!("  ⏱  {} timed out", report.timeouts);
    }
    if report.exhausted > 0 {
        println!("  ✗  {} reached the attempt limit", report.exhausted);
    }
    if report.delete_errors > 0 {
        println!("  !  {} local deletes failed", report.delete_errors);
    }
    for bucket in &report.finalized {
        println!(
            "  ✎  finalized timecode {} ({} files): {}",
            bucket.timecode,
            bucket.num_files,
            bucket.record_path.display()
        );
    }
}
