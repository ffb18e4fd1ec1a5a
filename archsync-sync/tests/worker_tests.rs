//! Sync Worker behaviour against scripted transports: round trip, retry
//! bound, timeouts, deletion timing and the full bucket finalization flow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use archsync_core::{
    checksum, ArchiveName, Checksum, NewFile, Registry, SyncFile, Timecode, WorkerConfig,
};
use archsync_sync::{finalize, LocalTransfer, SyncWorker, Transfer, TransferError};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Mode {
    Succeed,
    Fail,
    Corrupt,
    Hang,
    Slow,
}

struct Scripted {
    mode: Mode,
    stored: Mutex<HashMap<PathBuf, Checksum>>,
    copies: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    deny_removal: AtomicBool,
    removals: AtomicUsize,
}

impl Scripted {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            stored: Mutex::new(HashMap::new()),
            copies: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            deny_removal: AtomicBool::new(false),
            removals: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transfer for Scripted {
    async fn copy(&self, local: &Path, remote: &Path) -> Result<(), TransferError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Fail => {
                return Err(TransferError::NonZeroExit {
                    program: "rsync".to_string(),
                    status: "exit status: 12".to_string(),
                    stderr: "connection unexpectedly closed".to_string(),
                })
            }
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Mode::Slow => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Mode::Succeed | Mode::Corrupt => {}
        }
        let sum = checksum::hash_file(local).map_err(|e| TransferError::Io {
            path: local.to_path_buf(),
            source: e,
        })?;
        self.stored
            .lock()
            .expect("lock")
            .insert(remote.to_path_buf(), sum);
        Ok(())
    }

    async fn remote_checksum(&self, remote: &Path) -> Result<Checksum, TransferError> {
        if matches!(self.mode, Mode::Corrupt) {
            return Ok(Checksum::from("0".repeat(64)));
        }
        self.stored
            .lock()
            .expect("lock")
            .get(remote)
            .cloned()
            .ok_or_else(|| TransferError::BadChecksum(String::new()))
    }

    async fn remove_local(&self, local: &Path) -> std::io::Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        if self.deny_removal.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        tokio::fs::remove_file(local).await
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Env {
    tmp: TempDir,
    registry: Registry,
    config: WorkerConfig,
}

fn env() -> Env {
    let tmp = TempDir::new().expect("tempdir");
    std::fs::create_dir_all(tmp.path().join("data")).expect("mkdir");
    let mut config = WorkerConfig::new(
        "alpha",
        tmp.path().join("remote"),
        tmp.path().join("final"),
        "w1",
    );
    config.max_copy_attempts = 3;
    config.copy_timeout_secs = 5;
    config.cmd_timeout_secs = 5;
    Env {
        registry: Registry::open_in_memory().expect("registry"),
        config,
        tmp,
    }
}

fn alpha() -> ArchiveName {
    ArchiveName::from("alpha")
}

fn in_bucket(tc: i64) -> DateTime<Utc> {
    Timecode(tc).start().expect("in range") + chrono::Duration::seconds(120)
}

impl Env {
    fn add_at(&self, name: &str, remote: &str, at: DateTime<Utc>) -> SyncFile {
        let local = self.tmp.path().join("data").join(name);
        std::fs::write(&local, format!("contents of {name}")).expect("write");
        self.registry
            .add_file(NewFile::new(&local, remote, "alpha").registered_at(at))
            .expect("add")
            .into_file()
    }

    fn add(&self, name: &str) -> SyncFile {
        self.add_at(name, name, Utc::now())
    }

    fn worker(&self, transfer: Arc<dyn Transfer>) -> SyncWorker {
        SyncWorker::new(self.registry.clone(), self.config.clone(), transfer)
    }

    fn reload(&self, file: &SyncFile) -> SyncFile {
        self.registry
            .get_file_by_id(file.id)
            .expect("get")
            .expect("row")
    }
}

// ---------------------------------------------------------------------------
// 1. Copy / verify / retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_transfer_copies_within_one_iteration() {
    let env = env();
    let file = env.add("a.dat");
    let mut worker = env.worker(Arc::new(LocalTransfer));

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.attempted, 1);
    assert_eq!(report.copied, 1);

    let stored = env.reload(&file);
    assert!(stored.copied);
    assert_eq!(stored.remote_checksum.as_ref(), Some(&stored.local_checksum));
    assert!(stored.copied_at.is_some());
    let remote = env.config.remote_base_dir.join("a.dat");
    assert_eq!(
        std::fs::read_to_string(remote).expect("remote"),
        "contents of a.dat"
    );
    assert_eq!(worker.counters().copies, 1);
}

#[tokio::test]
async fn failing_transfer_stops_at_max_attempts() {
    let env = env();
    let file = env.add("a.dat");
    let transfer = Scripted::new(Mode::Fail);
    let mut worker = env.worker(transfer.clone());

    let mut previous = 0;
    for _ in 0..6 {
        worker.run_iteration().await.expect("iteration");
        let attempts = env.reload(&file).failed_copy_attempts;
        assert!(attempts >= previous, "attempts must never decrease");
        previous = attempts;
    }
    assert_eq!(previous, 3);
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 3);

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.attempted, 0);
    assert_eq!(env.reload(&file).failed_copy_attempts, 3);
    assert_eq!(
        env.registry
            .permanently_failed(&alpha(), 3)
            .expect("failed")
            .len(),
        1
    );
    assert_eq!(worker.counters().errors_transfer, 3);
}

#[tokio::test]
async fn exhaustion_is_reported_once() {
    let env = env();
    env.add("a.dat");
    let mut worker = env.worker(Scripted::new(Mode::Fail));
    let mut exhausted = 0;
    for _ in 0..5 {
        exhausted += worker.run_iteration().await.expect("iteration").exhausted;
    }
    assert_eq!(exhausted, 1);
}

#[tokio::test]
async fn checksum_mismatch_counts_as_failure_and_keeps_remote_digest() {
    let env = env();
    let file = env.add("a.dat");
    let mut worker = env.worker(Scripted::new(Mode::Corrupt));

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.failed, 1);
    let stored = env.reload(&file);
    assert!(!stored.copied);
    assert_eq!(stored.failed_copy_attempts, 1);
    assert_eq!(stored.remote_checksum, Some(Checksum::from("0".repeat(64))));
}

#[tokio::test(start_paused = true)]
async fn hung_copy_times_out_as_a_failed_attempt() {
    let env = env();
    let file = env.add("a.dat");
    let mut worker = env.worker(Scripted::new(Mode::Hang));

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.timeouts, 1);
    assert_eq!(report.failed, 1);
    let stored = env.reload(&file);
    assert!(!stored.copied);
    assert_eq!(stored.failed_copy_attempts, 1);
    assert_eq!(worker.counters().errors_timeout, 1);
}

#[tokio::test]
async fn missing_local_file_counts_as_failed_attempt() {
    let env = env();
    let file = env.add("a.dat");
    std::fs::remove_file(&file.local_path).expect("rm");
    let transfer = Scripted::new(Mode::Succeed);
    let mut worker = env.worker(transfer.clone());

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.failed, 1);
    assert_eq!(env.reload(&file).failed_copy_attempts, 1);
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn batch_size_bounds_attempts_per_iteration() {
    let mut env = env();
    env.config.files_per_batch = Some(2);
    let base = Utc::now();
    let files: Vec<_> = (0..3)
        .map(|i| {
            env.add_at(
                &format!("f{i}.dat"),
                &format!("f{i}.dat"),
                base + chrono::Duration::seconds(i),
            )
        })
        .collect();
    let mut worker = env.worker(Scripted::new(Mode::Succeed));

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.attempted, 2);
    assert!(env.reload(&files[0]).copied && env.reload(&files[1]).copied);
    assert!(!env.reload(&files[2]).copied, "newest file waits for next batch");
}

#[tokio::test(start_paused = true)]
async fn copies_run_with_bounded_parallelism() {
    let mut env = env();
    env.config.copy_concurrency = 2;
    for i in 0..5 {
        env.add(&format!("f{i}.dat"));
    }
    let transfer = Scripted::new(Mode::Slow);
    let mut worker = env.worker(transfer.clone());

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.copied, 5);
    assert_eq!(transfer.peak.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// 2. Deletion sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deletion_honours_delete_local_after_relative_to_copied_at() {
    let mut env = env();
    env.config.delete_local_after_secs = Some(3600);
    let old = env.add("old.dat");
    let young = env.add("young.dat");
    let now = Utc::now();
    env.registry
        .mark_copied(old.id, &old.local_checksum, now - chrono::Duration::seconds(3601))
        .expect("copy old");
    env.registry
        .mark_copied(young.id, &young.local_checksum, now - chrono::Duration::seconds(3599))
        .expect("copy young");
    let mut worker = env.worker(Scripted::new(Mode::Succeed));

    let report = worker.run_iteration_at(now).await.expect("iteration");
    assert_eq!(report.removed, 1);
    let old_row = env.reload(&old);
    assert!(old_row.removed && old_row.copied);
    assert!(!old.local_path.exists());
    assert!(!env.reload(&young).removed);
    assert!(young.local_path.exists());
}

#[tokio::test]
async fn unsynced_files_are_never_deleted() {
    let mut env = env();
    env.config.delete_local_after_secs = Some(0);
    let file = env.add("a.dat");
    let mut worker = env.worker(Scripted::new(Mode::Fail));

    for _ in 0..4 {
        worker
            .run_iteration_at(Utc::now() + chrono::Duration::days(10))
            .await
            .expect("iteration");
    }
    let stored = env.reload(&file);
    assert!(!stored.removed);
    assert!(file.local_path.exists());
}

#[tokio::test]
async fn no_deletion_without_delete_local_after() {
    let env = env();
    let file = env.add("a.dat");
    let mut worker = env.worker(Scripted::new(Mode::Succeed));
    worker
        .run_iteration_at(Utc::now() + chrono::Duration::days(365))
        .await
        .expect("iteration");
    assert!(env.reload(&file).copied);
    assert!(file.local_path.exists());
}

#[tokio::test]
async fn vanished_local_file_is_left_unremoved() {
    let mut env = env();
    env.config.delete_local_after_secs = Some(60);
    let file = env.add("a.dat");
    let now = Utc::now();
    env.registry
        .mark_copied(file.id, &file.local_checksum, now - chrono::Duration::hours(1))
        .expect("copy");
    std::fs::remove_file(&file.local_path).expect("rm");
    let mut worker = env.worker(Scripted::new(Mode::Succeed));

    let report = worker.run_iteration_at(now).await.expect("iteration");
    assert_eq!(report.delete_errors, 1);
    assert!(!env.reload(&file).removed);
    assert!(!worker.deletion_disabled());
}

#[tokio::test]
async fn permission_denied_disables_deletion_but_not_copying() {
    let mut env = env();
    env.config.delete_local_after_secs = Some(60);
    let first = env.add("first.dat");
    let second = env.add("second.dat");
    let now = Utc::now();
    for file in [&first, &second] {
        env.registry
            .mark_copied(file.id, &file.local_checksum, now - chrono::Duration::hours(1))
            .expect("copy");
    }
    let transfer = Scripted::new(Mode::Succeed);
    transfer.deny_removal.store(true, Ordering::SeqCst);
    let mut worker = env.worker(transfer.clone());

    let report = worker.run_iteration_at(now).await.expect("iteration");
    assert_eq!(report.removed, 0);
    assert_eq!(report.delete_errors, 1);
    assert_eq!(transfer.removals.load(Ordering::SeqCst), 1, "sweep stops at the first denial");
    assert!(worker.deletion_disabled());
    assert!(!env.reload(&first).removed);
    assert!(!env.reload(&second).removed);

    // Deletion stays off even once the filesystem would allow it.
    transfer.deny_removal.store(false, Ordering::SeqCst);
    let late = env.add("late.dat");
    let later = now + chrono::Duration::hours(2);
    let report = worker.run_iteration_at(later).await.expect("iteration");
    assert_eq!(report.copied, 1);
    assert!(env.reload(&late).copied);
    assert_eq!(report.removed, 0);
    assert_eq!(transfer.removals.load(Ordering::SeqCst), 1);
    assert!(first.local_path.exists() && second.local_path.exists());
    assert!(worker.deletion_disabled());

    // A fresh worker instance deletes again.
    let mut restarted = env.worker(transfer.clone());
    let report = restarted.run_iteration_at(later).await.expect("iteration");
    assert_eq!(report.removed, 2, "files copied an hour before are due; late.dat is not");
    assert!(!first.local_path.exists() && !second.local_path.exists());
    assert!(!restarted.deletion_disabled());
}

#[tokio::test]
async fn out_of_range_settings_do_not_panic_an_unvalidated_worker() {
    let mut env = env();
    env.config.delete_local_after_secs = Some(10_000_000_000_000);
    env.config.copy_concurrency = usize::MAX;
    env.config.copy_timeout_secs = u64::MAX;
    env.config.cmd_timeout_secs = u64::MAX;
    assert!(env.config.validate().is_err());
    let file = env.add("a.dat");
    let mut worker = env.worker(Scripted::new(Mode::Succeed));

    let report = worker.run_iteration().await.expect("iteration");
    assert_eq!(report.copied, 1);
    assert_eq!(report.removed, 0);
    assert!(env.reload(&file).copied);
    assert!(file.local_path.exists());
}

// ---------------------------------------------------------------------------
// 3. End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_files_then_newer_timecode_finalizes_bucket_once() {
    let env = env();
    for (i, name) in ["a.dat", "b.dat", "c.dat"].iter().enumerate() {
        env.add_at(
            name,
            &format!("100/{name}"),
            in_bucket(100) + chrono::Duration::seconds(i as i64),
        );
    }
    let mut worker = env.worker(Arc::new(LocalTransfer));

    worker.run_iteration_at(in_bucket(100)).await.expect("first");
    let bucket = env
        .registry
        .bucket(&alpha(), Timecode(100))
        .expect("bucket")
        .expect("row");
    assert!(bucket.synced && !bucket.complete && !bucket.finalized);

    env.add_at("d.dat", "101/d.dat", in_bucket(101));
    let report = worker
        .run_iteration_at(in_bucket(101))
        .await
        .expect("second");
    assert_eq!(report.finalized.len(), 1);
    assert_eq!(report.finalized[0].num_files, 3);

    let bucket = env
        .registry
        .bucket(&alpha(), Timecode(100))
        .expect("bucket")
        .expect("row");
    assert!(bucket.complete && bucket.synced && bucket.finalized);
    assert_eq!(bucket.file_count, 3);

    let record_id = bucket.finalize_file_id.expect("record id");
    let record_row = env
        .registry
        .get_file_by_id(record_id)
        .expect("get")
        .expect("row");
    assert!(!record_row.copied, "record is copied by the following iteration");
    let record = finalize::read(&record_row.local_path).expect("read record");
    assert_eq!(record.num_files, 3);
    assert_eq!(record.timecode, 100);
    assert_eq!(record.subdirs, vec!["100".to_string()]);
    assert_eq!(record.instance_id, "w1");

    for _ in 0..3 {
        let again = worker
            .run_iteration_at(in_bucket(101))
            .await
            .expect("later");
        assert!(again.finalized.is_empty());
    }
    assert!(env.reload(&record_row).copied);
    assert!(env
        .config
        .remote_base_dir
        .join(&record_row.remote_path)
        .exists());

    let records = env
        .registry
        .files(&alpha())
        .expect("files")
        .into_iter()
        .filter(|f| f.remote_path.to_string_lossy().contains("/archsync/"))
        .count();
    assert_eq!(records, 1);
}

#[tokio::test]
async fn registry_view_is_all_a_restarted_worker_needs() {
    let env = env();
    let file = env.add("a.dat");
    {
        let mut first = env.worker(Scripted::new(Mode::Fail));
        first.run_iteration().await.expect("iteration");
    }
    let mut second = env.worker(Scripted::new(Mode::Succeed));
    second.run_iteration().await.expect("iteration");
    let stored = env.reload(&file);
    assert!(stored.copied);
    assert_eq!(stored.failed_copy_attempts, 1);
}
