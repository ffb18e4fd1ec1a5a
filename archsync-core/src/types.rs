//! Domain types for the archsync file registry.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Rows are plain values re-read from the registry on every polling cycle;
//! nothing here caches state across cycles.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::timecode::Timecode;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Name of a logical file stream. Each archive is owned by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveName(pub String);

impl ArchiveName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Archive names end up in file names and SQL filters: non-empty,
    /// ASCII alphanumerics plus `_`, `-` and `.` only.
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("archive name must not be empty".to_string());
        }
        if let Some(bad) = self
            .0
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(format!(
                "archive name '{}' contains invalid character '{bad}'",
                self.0
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ArchiveName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ArchiveName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of a worker instance, written into finalization records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// File state
// ---------------------------------------------------------------------------

/// Lifecycle of a tracked file, derived from the stored
/// `copied` / `failed_copy_attempts` / `removed` columns.
///
/// ```text
/// Unsynced --copy+verify ok--> Synced --older than delete_local_after--> Removed
/// Unsynced --attempts >= max--> PermanentlyFailed
/// Unsynced --operator sets ignore--> Ignored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Unsynced,
    Synced,
    PermanentlyFailed,
    Removed,
    /// Excluded by an operator: never copied and not counted as outstanding.
    Ignored,
}

impl FileState {
    /// States no polling iteration will ever move a file out of.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileState::PermanentlyFailed | FileState::Removed | FileState::Ignored
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::Unsynced => write!(f, "unsynced"),
            FileState::Synced => write!(f, "synced"),
            FileState::PermanentlyFailed => write!(f, "permanently_failed"),
            FileState::Removed => write!(f, "removed"),
            FileState::Ignored => write!(f, "ignored"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFile {
    pub id: i64,
    /// Absolute path on the producing host. Unique across the registry.
    pub local_path: PathBuf,
    /// Path relative to the archive's remote base directory.
    pub remote_path: PathBuf,
    pub archive_name: ArchiveName,
    pub local_checksum: Checksum,
    /// Checksum last reported by the remote side, matching or not.
    pub remote_checksum: Option<Checksum>,
    pub copied: bool,
    pub failed_copy_attempts: u32,
    pub removed: bool,
    /// `false` keeps the local copy forever, even once synced.
    pub deletable: bool,
    pub timecode: Timecode,
    pub created_at: DateTime<Utc>,
    pub copied_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
    /// Skipped by the worker and left out of `finalized_until` and the
    /// pending count.
    pub ignored: bool,
}

impl SyncFile {
    pub fn state(&self, max_copy_attempts: u32) -> FileState {
        if self.removed {
            FileState::Removed
        } else if self.copied {
            FileState::Synced
        } else if self.ignored {
            FileState::Ignored
        } else if self.failed_copy_attempts >= max_copy_attempts {
            FileState::PermanentlyFailed
        } else {
            FileState::Unsynced
        }
    }
}

/// Completeness / sync / finalization flags for one `(archive, timecode)` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimecodeBucket {
    pub archive_name: ArchiveName,
    pub timecode: Timecode,
    pub complete: bool,
    pub synced: bool,
    pub finalized: bool,
    pub file_count: u64,
    pub subdirectories: Vec<String>,
    pub finalize_file_id: Option<i64>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Coarse progress of a bucket, for operator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketPhase {
    /// More files may still arrive.
    Open,
    /// Closed, but some files are not yet copied.
    AwaitingSync,
    /// Closed and copied; the record has not been emitted yet.
    ReadyToFinalize,
    Finalized,
}

impl TimecodeBucket {
    pub fn phase(&self) -> BucketPhase {
        match (self.finalized, self.complete, self.synced) {
            (true, _, _) => BucketPhase::Finalized,
            (false, false, _) => BucketPhase::Open,
            (false, true, false) => BucketPhase::AwaitingSync,
            (false, true, true) => BucketPhase::ReadyToFinalize,
        }
    }
}

impl fmt::Display for BucketPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketPhase::Open => write!(f, "open"),
            BucketPhase::AwaitingSync => write!(f, "awaiting_sync"),
            BucketPhase::ReadyToFinalize => write!(f, "ready_to_finalize"),
            BucketPhase::Finalized => write!(f, "finalized"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Arguments for registering a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub local_path: PathBuf,
    pub remote_path: PathBuf,
    pub archive_name: ArchiveName,
    /// Registration moment; the timecode derives from it. `None` = now.
    pub registered_at: Option<DateTime<Utc>>,
    pub deletable: bool,
}

impl NewFile {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<PathBuf>,
        archive_name: impl Into<ArchiveName>,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            archive_name: archive_name.into(),
            registered_at: None,
            deletable: true,
        }
    }

    pub fn registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.registered_at = Some(at);
        self
    }

    pub fn deletable(mut self, deletable: bool) -> Self {
        self.deletable = deletable;
        self
    }
}

/// Outcome of [`crate::Registry::add_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added(SyncFile),
    /// `local_path` was already tracked; the row is returned untouched.
    AlreadyRegistered(SyncFile),
}

impl Registration {
    pub fn file(&self) -> &SyncFile {
        match self {
            Registration::Added(file) | Registration::AlreadyRegistered(file) => file,
        }
    }

    pub fn into_file(self) -> SyncFile {
        match self {
            Registration::Added(file) | Registration::AlreadyRegistered(file) => file,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Added(_))
    }
}

/// Summary written alongside a bucket's `finalized` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSummary {
    pub file_count: u64,
    pub subdirectories: Vec<String>,
    pub finalized_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-archive counts derived purely from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub archive_name: ArchiveName,
    pub total_files: u64,
    pub copied: u64,
    pub pending: u64,
    pub permanently_failed: u64,
    pub removed: u64,
    pub ignored: u64,
    pub buckets: u64,
    pub finalized_buckets: u64,
    pub last_file_added: Option<PathBuf>,
    pub last_file_copied: Option<PathBuf>,
    /// Every non-ignored file registered before this moment has been copied.
    pub finalized_until: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
