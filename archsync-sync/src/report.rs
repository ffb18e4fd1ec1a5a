//! Operator report, derived purely from the registry.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use archsync_core::{ArchiveName, ArchiveStats, BucketPhase, Registry, Timecode};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketLine {
    pub timecode: Timecode,
    pub phase: BucketPhase,
    pub file_count: u64,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub stats: ArchiveStats,
    pub buckets: Vec<BucketLine>,
    pub permanently_failed: Vec<PathBuf>,
}

pub fn archive_report(
    registry: &Registry,
    archive: &ArchiveName,
    max_copy_attempts: u32,
) -> Result<ArchiveReport, SyncError> {
    archive_report_at(registry, archive, max_copy_attempts, Utc::now())
}

pub fn archive_report_at(
    registry: &Registry,
    archive: &ArchiveName,
    max_copy_attempts: u32,
    now: DateTime<Utc>,
) -> Result<ArchiveReport, SyncError> {
    let stats = registry.archive_stats_at(archive, max_copy_attempts, now)?;
    let buckets = registry
        .buckets(archive)?
        .into_iter()
        .map(|b| BucketLine {
            timecode: b.timecode,
            phase: b.phase(),
            // Unfinalized buckets have no stored summary yet.
            file_count: b.file_count,
            finalized_at: b.finalized_at,
        })
        .collect();
    let permanently_failed = registry
        .permanently_failed(archive, max_copy_attempts)?
        .into_iter()
        .map(|f| f.local_path)
        .collect();
    Ok(ArchiveReport {
        stats,
        buckets,
        permanently_failed,
    })
}

/// Compact age such as `42s`, `5m`, `3h`, `2d`.
pub fn format_age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(timestamp).num_seconds().max(0) as u64;
    format_seconds(age)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}
