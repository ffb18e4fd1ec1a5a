//! Finalization records.
//!
//! ```text
//! <finalization_root>/<now_tc>/<worker_id>/<unix_ts>_<archive>_<tc>_finalized.yaml   (local)
//! <now_tc>/archsync/<worker_id>/<unix_ts>_<archive>_<tc>_finalized.yaml              (remote)
//! ```
//!
//! The remote path is relative to the archive's `remote_base_dir`, like every
//! other registered file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use archsync_core::{ArchiveName, SyncFile, Timecode, WorkerId};

use crate::error::{io_err, SyncError};

/// Directory component every record's remote path passes through.
pub const REMOTE_RECORD_DIR: &str = "archsync";

/// Body of the YAML document consumed by downstream packaging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationRecord {
    pub timecode: i64,
    pub archive_name: String,
    pub num_files: u64,
    pub subdirs: Vec<String>,
    /// Unix seconds.
    pub finalized_at: f64,
    /// Unix seconds; every file registered before this moment was copied.
    pub finalized_until: f64,
    pub instance_id: String,
}

impl FinalizationRecord {
    pub fn new(
        archive: &ArchiveName,
        timecode: Timecode,
        files: &[SyncFile],
        worker: &WorkerId,
        finalized_at: DateTime<Utc>,
        finalized_until: DateTime<Utc>,
    ) -> Self {
        Self {
            timecode: timecode.0,
            archive_name: archive.0.clone(),
            num_files: files.len() as u64,
            subdirs: subdirectories(files),
            finalized_at: unix_seconds(finalized_at),
            finalized_until: unix_seconds(finalized_until),
            instance_id: worker.0.clone(),
        }
    }
}

/// `<unix_ts>_<archive>_<tc>_finalized.yaml`
pub fn file_name(archive: &ArchiveName, timecode: Timecode, now: DateTime<Utc>) -> String {
    format!("{}_{}_{}_finalized.yaml", now.timestamp(), archive, timecode)
}

pub fn local_path(
    root: &Path,
    worker: &WorkerId,
    archive: &ArchiveName,
    timecode: Timecode,
    now: DateTime<Utc>,
) -> PathBuf {
    root.join(Timecode::from_datetime(now).to_string())
        .join(&worker.0)
        .join(file_name(archive, timecode, now))
}

pub fn remote_path(
    worker: &WorkerId,
    archive: &ArchiveName,
    timecode: Timecode,
    now: DateTime<Utc>,
) -> PathBuf {
    PathBuf::from(Timecode::from_datetime(now).to_string())
        .join(REMOTE_RECORD_DIR)
        .join(&worker.0)
        .join(file_name(archive, timecode, now))
}

/// Sorted, distinct parent directories of the files' remote paths.
/// Files at the top of the archive contribute nothing.
pub fn subdirectories(files: &[SyncFile]) -> Vec<String> {
    files
        .iter()
        .filter_map(|f| f.remote_path.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Write flow: serialize → `.tmp` sibling → `rename`.
pub fn write(path: &Path, record: &FinalizationRecord) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let yaml = serde_yaml::to_string(record)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

pub fn read(path: &Path) -> Result<FinalizationRecord, SyncError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_yaml::from_str(&contents)?)
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsync_core::Checksum;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn file(remote: &str) -> SyncFile {
        SyncFile {
            id: 1,
            local_path: PathBuf::from("/data").join(remote),
            remote_path: PathBuf::from(remote),
            archive_name: ArchiveName::from("alpha"),
            local_checksum: Checksum::from("00"),
            remote_checksum: None,
            copied: true,
            failed_copy_attempts: 0,
            removed: false,
            deletable: true,
            timecode: Timecode(100),
            created_at: Utc::now(),
            copied_at: None,
            removed_at: None,
            ignored: false,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(10_100_042, 0).single().unwrap()
    }

    #[test]
    fn paths_follow_naming_convention() {
        let worker = WorkerId::from("w1");
        let archive = ArchiveName::from("alpha");
        let local = local_path(Path::new("/final"), &worker, &archive, Timecode(100), at());
        assert_eq!(
            local,
            PathBuf::from("/final/101/w1/10100042_alpha_100_finalized.yaml")
        );
        let remote = remote_path(&worker, &archive, Timecode(100), at());
        assert_eq!(
            remote,
            PathBuf::from("101/archsync/w1/10100042_alpha_100_finalized.yaml")
        );
    }

    #[test]
    fn subdirectories_are_sorted_and_distinct() {
        let files = vec![
            file("100/smurf/b.g3"),
            file("100/hk/a.g3"),
            file("100/smurf/c.g3"),
            file("top.dat"),
        ];
        assert_eq!(subdirectories(&files), vec!["100/hk", "100/smurf"]);
    }

    #[test]
    fn write_then_read_yaml_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x/rec.yaml");
        let record = FinalizationRecord::new(
            &ArchiveName::from("alpha"),
            Timecode(100),
            &[file("a/1.dat"), file("a/2.dat"), file("b/3.dat")],
            &WorkerId::from("w1"),
            at(),
            at(),
        );
        write(&path, &record).expect("write");
        assert!(!tmp.path().join("x/rec.yaml.tmp").exists());

        let raw = std::fs::read_to_string(&path).unwrap();
        for key in [
            "timecode:",
            "archive_name:",
            "num_files: 3",
            "subdirs:",
            "finalized_at:",
            "finalized_until:",
            "instance_id: w1",
        ] {
            assert!(raw.contains(key), "missing {key} in {raw}");
        }
        assert_eq!(read(&path).unwrap(), record);
    }
}
