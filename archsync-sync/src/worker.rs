//! Sync Worker: one per archive.
//!
//! An iteration runs three phases against freshly read registry state:
//!
//! 1. copy: oldest-first batch of eligible files, each copied and verified as
//!    one unit of work, at most `copy_concurrency` in flight
//! 2. sweep: delete local bytes of files copied more than
//!    `delete_local_after` ago
//! 3. track: re-evaluate unfinalized timecode buckets
//!
//! Only the outcome of a fully finished copy+verify is committed. A copy task
//! that fails, times out or finds a mismatched digest commits exactly one
//! failed attempt and nothing else.
//!
//! Registry access and the tracker pass run on the blocking pool; only the
//! transfer futures run on the async worker threads.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use archsync_core::{Checksum, Registry, SyncFile, WorkerConfig};

use crate::error::{SyncError, TransferError};
use crate::tracker::{FinalizedBucket, TimecodeTracker};
use crate::transfer::Transfer;

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub attempted: usize,
    pub copied: usize,
    pub failed: usize,
    pub timeouts: usize,
    /// Files that used their last attempt this iteration.
    pub exhausted: usize,
    pub removed: usize,
    pub delete_errors: usize,
    pub finalized: Vec<FinalizedBucket>,
}

/// Running totals kept for status reporting only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub iterations: u64,
    pub copies: u64,
    pub errors_timeout: u64,
    pub errors_transfer: u64,
}

/// Result of one copy+verify unit of work, before it is committed.
#[derive(Debug)]
enum CopyOutcome {
    Verified(Checksum),
    Mismatch(Checksum),
    MissingLocal,
    Failed(TransferError),
}

pub struct SyncWorker {
    registry: Registry,
    config: WorkerConfig,
    transfer: Arc<dyn Transfer>,
    deletion_disabled: bool,
    counters: WorkerCounters,
}

impl SyncWorker {
    pub fn new(registry: Registry, config: WorkerConfig, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            registry,
            config,
            transfer,
            deletion_disabled: false,
            counters: WorkerCounters::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn counters(&self) -> WorkerCounters {
        self.counters
    }

    /// Set after a permission error during the sweep; cleared only by
    /// constructing a new worker.
    pub fn deletion_disabled(&self) -> bool {
        self.deletion_disabled
    }

    pub async fn run_iteration(&mut self) -> Result<IterationReport, SyncError> {
        self.iterate(None).await
    }

    /// Like [`run_iteration`](Self::run_iteration) with every timestamp pinned
    /// to `now`.
    pub async fn run_iteration_at(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<IterationReport, SyncError> {
        self.iterate(Some(now)).await
    }

    async fn iterate(
        &mut self,
        fixed: Option<DateTime<Utc>>,
    ) -> Result<IterationReport, SyncError> {
        let mut report = IterationReport::default();
        self.counters.iterations += 1;

        self.copy_batch(fixed, &mut report).await?;
        self.sweep(fixed.unwrap_or_else(Utc::now), &mut report).await?;

        let registry = self.registry.clone();
        let config = self.config.clone();
        let now = fixed.unwrap_or_else(Utc::now);
        report.finalized =
            blocking(move || TimecodeTracker::new(&registry, &config).evaluate_at(now)).await?;

        if report.attempted > 0 || report.removed > 0 || !report.finalized.is_empty() {
            tracing::info!(
                archive = %self.config.archive_name,
                attempted = report.attempted,
                copied = report.copied,
                failed = report.failed,
                removed = report.removed,
                finalized = report.finalized.len(),
                "sync iteration finished",
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Copy phase
    // -----------------------------------------------------------------------

    async fn copy_batch(
        &mut self,
        fixed: Option<DateTime<Utc>>,
        report: &mut IterationReport,
    ) -> Result<(), SyncError> {
        let registry = self.registry.clone();
        let archive = self.config.archive_name.clone();
        let (max_attempts, limit) = (self.config.max_copy_attempts, self.config.files_per_batch);
        let batch =
            blocking(move || Ok(registry.copyable_files(&archive, max_attempts, limit)?)).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let concurrency = self.config.copy_concurrency.clamp(1, Semaphore::MAX_PERMITS);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for file in batch {
            let permits = Arc::clone(&permits);
            let transfer = Arc::clone(&self.transfer);
            let remote = self.config.remote_base_dir.join(&file.remote_path);
            let copy_timeout = self.config.copy_timeout();
            let cmd_timeout = self.config.cmd_timeout();
            tasks.spawn(async move {
                // Closed only if the semaphore is dropped, which it never is here.
                let _permit = permits.acquire_owned().await.ok();
                let outcome =
                    copy_and_verify(transfer.as_ref(), &file, remote, copy_timeout, cmd_timeout)
                        .await;
                (file, outcome)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (file, outcome) = joined.map_err(|e| SyncError::Join(e.to_string()))?;
            report.attempted += 1;
            if first_error.is_some() {
                continue;
            }
            let now = fixed.unwrap_or_else(Utc::now);
            if let Err(e) = self.commit(&file, outcome, now, report).await {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn commit(
        &mut self,
        file: &SyncFile,
        outcome: CopyOutcome,
        now: DateTime<Utc>,
        report: &mut IterationReport,
    ) -> Result<(), SyncError> {
        let archive = self.config.archive_name.clone();
        let registry = self.registry.clone();
        let id = file.id;
        let (remote_checksum, reason) = match outcome {
            CopyOutcome::Verified(sum) => {
                blocking(move || Ok(registry.mark_copied(id, &sum, now)?)).await?;
                report.copied += 1;
                self.counters.copies += 1;
                tracing::info!(
                    archive = %archive,
                    path = %file.local_path.display(),
                    remote = %file.remote_path.display(),
                    "file copied and verified",
                );
                return Ok(());
            }
            CopyOutcome::Mismatch(sum) => {
                let reason = format!("remote checksum {sum} != local {}", file.local_checksum);
                (Some(sum), reason)
            }
            CopyOutcome::MissingLocal => (None, "local file is missing".to_string()),
            CopyOutcome::Failed(err) => {
                if err.is_timeout() {
                    report.timeouts += 1;
                    self.counters.errors_timeout += 1;
                } else {
                    self.counters.errors_transfer += 1;
                }
                (None, err.to_string())
            }
        };

        let attempts =
            blocking(move || Ok(registry.record_failed_attempt(id, remote_checksum.as_ref())?))
                .await?;
        report.failed += 1;
        if attempts >= self.config.max_copy_attempts {
            report.exhausted += 1;
            tracing::error!(
                archive = %archive,
                path = %file.local_path.display(),
                attempts,
                reason = %reason,
                "copy attempts exhausted; file needs operator attention",
            );
        } else {
            tracing::warn!(
                archive = %archive,
                path = %file.local_path.display(),
                attempts,
                max_attempts = self.config.max_copy_attempts,
                reason = %reason,
                "copy attempt failed; will retry",
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deletion sweep
    // -----------------------------------------------------------------------

    async fn sweep(
        &mut self,
        now: DateTime<Utc>,
        report: &mut IterationReport,
    ) -> Result<(), SyncError> {
        let Some(after) = self.config.delete_local_after() else {
            return Ok(());
        };
        if self.deletion_disabled {
            return Ok(());
        }

        let archive = self.config.archive_name.clone();
        let Some(cutoff) = now.checked_sub_signed(after) else {
            tracing::warn!(
                archive = %archive,
                delete_local_after_secs = ?self.config.delete_local_after_secs,
                "deletion window reaches before the representable range; nothing is old enough",
            );
            return Ok(());
        };

        let registry = self.registry.clone();
        let query_archive = archive.clone();
        let due = blocking(move || Ok(registry.deletable_files(&query_archive, cutoff)?)).await?;
        for file in due {
            match self.transfer.remove_local(&file.local_path).await {
                Ok(()) => {
                    let registry = self.registry.clone();
                    let id = file.id;
                    blocking(move || Ok(registry.mark_removed(id, now)?)).await?;
                    report.removed += 1;
                    tracing::debug!(
                        archive = %archive,
                        path = %file.local_path.display(),
                        "local copy removed",
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.delete_errors += 1;
                    tracing::error!(
                        archive = %archive,
                        path = %file.local_path.display(),
                        "local file vanished before deletion; leaving row unremoved",
                    );
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    report.delete_errors += 1;
                    self.deletion_disabled = true;
                    tracing::error!(
                        archive = %archive,
                        path = %file.local_path.display(),
                        error = %e,
                        "permission denied deleting local file; \
                         local deletion disabled for this worker until restart",
                    );
                    break;
                }
                Err(e) => {
                    report.delete_errors += 1;
                    tracing::error!(
                        archive = %archive,
                        path = %file.local_path.display(),
                        error = %e,
                        "failed to delete local file",
                    );
                }
            }
        }
        Ok(())
    }
}

/// Run registry or filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SyncError::Join(e.to_string()))?
}

async fn copy_and_verify(
    transfer: &dyn Transfer,
    file: &SyncFile,
    remote: PathBuf,
    copy_timeout: Duration,
    cmd_timeout: Duration,
) -> CopyOutcome {
    match tokio::fs::metadata(&file.local_path).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return CopyOutcome::MissingLocal,
        Err(e) => {
            return CopyOutcome::Failed(TransferError::Io {
                path: file.local_path.clone(),
                source: e,
            })
        }
    }

    match tokio::time::timeout(copy_timeout, transfer.copy(&file.local_path, &remote)).await {
        Err(_) => {
            return CopyOutcome::Failed(TransferError::Timeout {
                operation: "copy",
                after: copy_timeout,
            })
        }
        Ok(Err(e)) => return CopyOutcome::Failed(e),
        Ok(Ok(())) => {}
    }

    match tokio::time::timeout(cmd_timeout, transfer.remote_checksum(&remote)).await {
        Err(_) => CopyOutcome::Failed(TransferError::Timeout {
            operation: "remote checksum",
            after: cmd_timeout,
        }),
        Ok(Err(e)) => CopyOutcome::Failed(e),
        Ok(Ok(sum)) if sum == file.local_checksum => CopyOutcome::Verified(sum),
        Ok(Ok(sum)) => CopyOutcome::Mismatch(sum),
    }
}
