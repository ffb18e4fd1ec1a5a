//! Timecode Tracker.
//!
//! Each pass re-reads every unfinalized bucket of the archive and decides:
//!
//! 1. `complete`: a newer timecode has a file, or the bucket is more than
//!    `complete_after_timecodes` behind the current timecode. Never reverts.
//! 2. `synced`: every file in the bucket is copied, not counting files an
//!    operator marked ignored. Recomputed each pass, so a late file can clear
//!    it again before finalization.
//! 3. complete and synced: write the record, register it and set
//!    `finalized` in one registry transaction.
//!
//! A registry error aborts the pass before any flag is written for the bucket
//! being evaluated; flags are never set speculatively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use archsync_core::{
    BucketSummary, NewFile, Registry, SyncFile, Timecode, TimecodeBucket, WorkerConfig,
};

use crate::error::SyncError;
use crate::finalize::{self, FinalizationRecord};

/// A bucket finalized during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedBucket {
    pub timecode: Timecode,
    pub num_files: u64,
    pub record_file_id: i64,
    pub record_path: std::path::PathBuf,
}

pub struct TimecodeTracker<'a> {
    registry: &'a Registry,
    config: &'a WorkerConfig,
}

impl<'a> TimecodeTracker<'a> {
    pub fn new(registry: &'a Registry, config: &'a WorkerConfig) -> Self {
        Self { registry, config }
    }

    pub fn evaluate(&self) -> Result<Vec<FinalizedBucket>, SyncError> {
        self.evaluate_at(Utc::now())
    }

    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Result<Vec<FinalizedBucket>, SyncError> {
        let archive = &self.config.archive_name;
        let current = Timecode::from_datetime(now);
        let mut finalized = Vec::new();

        for bucket in self.registry.open_buckets(archive)? {
            let complete = bucket.complete || self.is_closed(&bucket, current)?;
            let mut files = self.registry.bucket_files(archive, bucket.timecode)?;
            files.retain(|f| f.copied || !f.ignored);
            let synced = files.iter().all(|f| f.copied);

            if (complete, synced) != (bucket.complete, bucket.synced) {
                self.registry
                    .set_bucket_flags(archive, bucket.timecode, complete, synced)?;
                tracing::debug!(
                    archive = %archive,
                    timecode = %bucket.timecode,
                    complete,
                    synced,
                    "bucket flags updated",
                );
            }

            if complete && synced {
                if let Some(done) = self.finalize(&bucket, &files, now)? {
                    finalized.push(done);
                }
            }
        }
        Ok(finalized)
    }

    fn is_closed(&self, bucket: &TimecodeBucket, current: Timecode) -> Result<bool, SyncError> {
        if self
            .registry
            .has_newer_file(&bucket.archive_name, bucket.timecode)?
        {
            return Ok(true);
        }
        Ok(bucket.timecode.buckets_until(current) > self.config.complete_after_timecodes)
    }

    fn finalize(
        &self,
        bucket: &TimecodeBucket,
        files: &[SyncFile],
        now: DateTime<Utc>,
    ) -> Result<Option<FinalizedBucket>, SyncError> {
        let archive = &self.config.archive_name;
        let worker = &self.config.worker_id;
        let finalized_until = self.registry.finalized_until_at(archive, now)?;
        let record = FinalizationRecord::new(
            archive,
            bucket.timecode,
            files,
            worker,
            now,
            finalized_until,
        );

        let local = finalize::local_path(
            &self.config.finalization_root,
            worker,
            archive,
            bucket.timecode,
            now,
        );
        let remote = finalize::remote_path(worker, archive, bucket.timecode, now);
        finalize::write(&local, &record)?;

        let summary = BucketSummary {
            file_count: record.num_files,
            subdirectories: record.subdirs.clone(),
            finalized_at: now,
        };
        let registered = self.registry.finalize_bucket_at(
            archive,
            bucket.timecode,
            &summary,
            NewFile::new(&local, &remote, archive.clone()).registered_at(now),
            now,
        )?;

        let Some(file) = registered else {
            // Another pass won the race; our candidate file is unreferenced.
            if let Err(e) = std::fs::remove_file(&local) {
                tracing::warn!(
                    path = %local.display(),
                    error = %e,
                    "could not remove unused finalization record",
                );
            }
            return Ok(None);
        };

        tracing::info!(
            archive = %archive,
            timecode = %bucket.timecode,
            num_files = record.num_files,
            record = %local.display(),
            "timecode bucket finalized",
        );
        Ok(Some(FinalizedBucket {
            timecode: bucket.timecode,
            num_files: record.num_files,
            record_file_id: file.id,
            record_path: local,
        }))
    }
}
