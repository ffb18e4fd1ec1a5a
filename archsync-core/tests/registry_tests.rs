//! Registration API, idempotence and operator-report integration tests against
//! an on-disk registry under a temporary home.

use assert_fs::prelude::*;
use chrono::{DateTime, Duration, Utc};
use predicates::prelude::*;
use rstest::rstest;

use archsync_core::{
    checksum, registry, ArchiveName, FileState, NewFile, Registration, Registry, RegistryError,
    Timecode,
};

fn alpha() -> ArchiveName {
    ArchiveName::from("alpha")
}

fn in_bucket(tc: i64) -> DateTime<Utc> {
    Timecode(tc).start().expect("in range") + Duration::seconds(30)
}

fn open(home: &assert_fs::TempDir) -> Registry {
    Registry::open_at(&registry::db_path_at(home.path())).expect("open registry")
}

// ---------------------------------------------------------------------------
// 1. Registration
// ---------------------------------------------------------------------------

#[test]
fn open_creates_database_under_home() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let _registry = open(&home);
    home.child(".archsync/registry.db")
        .assert(predicate::path::is_file());
}

#[test]
fn registering_twice_keeps_one_row_and_its_state() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let data = home.child("data/a.dat");
    data.write_str("payload").expect("write");
    let registry = open(&home);

    let first = registry
        .add_file(NewFile::new(data.path(), "a.dat", "alpha"))
        .expect("first add")
        .into_file();
    registry
        .record_failed_attempt(first.id, None)
        .expect("fail once");
    registry
        .mark_copied(first.id, &first.local_checksum, Utc::now())
        .expect("copied");

    let second = registry
        .add_file(NewFile::new(data.path(), "a.dat", "alpha"))
        .expect("second add");
    assert!(matches!(second, Registration::AlreadyRegistered(_)));
    let file = second.file();
    assert_eq!(file.id, first.id);
    assert!(file.copied, "re-registration must not reset copied");
    assert_eq!(file.failed_copy_attempts, 1);
    assert_eq!(registry.files(&alpha()).expect("files").len(), 1);
}

#[test]
fn registering_with_different_destination_keeps_existing_row() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let data = home.child("data/a.dat");
    data.write_str("payload").expect("write");
    let registry = open(&home);

    registry
        .add_file(NewFile::new(data.path(), "a.dat", "alpha"))
        .expect("add");
    let again = registry
        .add_file(NewFile::new(data.path(), "elsewhere/a.dat", "alpha"))
        .expect("add again");
    assert!(!again.is_new());
    assert_eq!(again.file().remote_path, std::path::PathBuf::from("a.dat"));
}

#[test]
fn explicit_registration_time_selects_bucket() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let a = home.child("data/a.dat");
    let b = home.child("data/b.dat");
    a.write_str("a").expect("write");
    b.write_str("b").expect("write");
    let registry = open(&home);

    registry
        .add_file(NewFile::new(a.path(), "a.dat", "alpha").registered_at(in_bucket(100)))
        .expect("add a");
    registry
        .add_file(NewFile::new(b.path(), "b.dat", "alpha").registered_at(in_bucket(101)))
        .expect("add b");

    let buckets = registry.buckets(&alpha()).expect("buckets");
    let codes: Vec<i64> = buckets.iter().map(|b| b.timecode.0).collect();
    assert_eq!(codes, vec![100, 101]);
    assert!(registry
        .has_newer_file(&alpha(), Timecode(100))
        .expect("newer"));
    assert!(!registry
        .has_newer_file(&alpha(), Timecode(101))
        .expect("newer"));
}

#[test]
fn archives_are_partitioned() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let a = home.child("data/a.dat");
    let b = home.child("data/b.dat");
    a.write_str("a").expect("write");
    b.write_str("b").expect("write");
    let registry = open(&home);

    registry
        .add_file(NewFile::new(a.path(), "a.dat", "alpha"))
        .expect("add");
    registry
        .add_file(NewFile::new(b.path(), "b.dat", "beta"))
        .expect("add");

    let names: Vec<String> = registry
        .archives()
        .expect("archives")
        .into_iter()
        .map(|a| a.0)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(
        registry
            .copyable_files(&alpha(), 5, None)
            .expect("copyable")
            .len(),
        1
    );
}

#[test]
fn non_deletable_files_never_appear_in_sweep() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let keep = home.child("data/keep.dat");
    keep.write_str("keep").expect("write");
    let registry = open(&home);

    let file = registry
        .add_file(NewFile::new(keep.path(), "keep.dat", "alpha").deletable(false))
        .expect("add")
        .into_file();
    let long_ago = Utc::now() - Duration::days(30);
    registry
        .mark_copied(file.id, &file.local_checksum, long_ago)
        .expect("copied");

    assert!(registry
        .deletable_files(&alpha(), Utc::now())
        .expect("deletable")
        .is_empty());
}

// ---------------------------------------------------------------------------
// 2. Path correction
// ---------------------------------------------------------------------------

#[test]
fn correct_local_path_moves_row_when_content_matches() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let old = home.child("data/old.dat");
    old.write_str("same bytes").expect("write");
    let registry = open(&home);
    let original = registry
        .add_file(NewFile::new(old.path(), "x/old.dat", "alpha"))
        .expect("add")
        .into_file();
    registry
        .record_failed_attempt(original.id, None)
        .expect("fail");

    let new = home.child("moved/new.dat");
    new.write_str("same bytes").expect("write");
    std::fs::remove_file(old.path()).expect("rm old");

    let corrected = registry
        .correct_local_path(old.path(), new.path())
        .expect("correct");
    assert_eq!(corrected.id, original.id);
    assert_eq!(corrected.local_path, new.path());
    assert_eq!(corrected.failed_copy_attempts, 1);
    assert_eq!(corrected.remote_path, original.remote_path);
    assert!(registry.get_file(old.path()).expect("get").is_none());

    let by_sum = registry
        .find_by_checksum(&alpha(), &original.local_checksum)
        .expect("find");
    assert_eq!(by_sum.len(), 1);
    assert_eq!(by_sum[0].local_path, new.path());
}

#[test]
fn correct_local_path_rejects_different_content() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let old = home.child("data/old.dat");
    old.write_str("original").expect("write");
    let imposter = home.child("data/imposter.dat");
    imposter.write_str("something else").expect("write");
    let registry = open(&home);
    registry
        .add_file(NewFile::new(old.path(), "old.dat", "alpha"))
        .expect("add");

    let err = registry
        .correct_local_path(old.path(), imposter.path())
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)), "got: {err}");
    assert!(err.to_string().contains("does not match"));
    assert!(registry.get_file(old.path()).expect("get").is_some());
}

#[test]
fn correct_local_path_of_unknown_row_is_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let new = home.child("data/new.dat");
    new.write_str("x").expect("write");
    let registry = open(&home);
    let err = registry
        .correct_local_path(&home.path().join("data/never.dat"), new.path())
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 3. Operator report
// ---------------------------------------------------------------------------

#[rstest]
#[case::below_limit(2, FileState::Unsynced)]
#[case::at_limit(3, FileState::PermanentlyFailed)]
fn failures_map_to_state(#[case] failures: u32, #[case] expected: FileState) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let data = home.child("data/a.dat");
    data.write_str("a").expect("write");
    let registry = open(&home);
    let file = registry
        .add_file(NewFile::new(data.path(), "a.dat", "alpha"))
        .expect("add")
        .into_file();
    for _ in 0..failures {
        registry
            .record_failed_attempt(file.id, None)
            .expect("fail");
    }
    let stored = registry.get_file(data.path()).expect("get").expect("row");
    assert_eq!(stored.state(3), expected);
    let failed = registry.permanently_failed(&alpha(), 3).expect("failed");
    assert_eq!(failed.len(), usize::from(expected == FileState::PermanentlyFailed));
}

#[test]
fn archive_stats_summarise_every_state() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let registry = open(&home);
    let now = in_bucket(200);

    let mut ids = Vec::new();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        let child = home.child(format!("data/{name}.dat"));
        child.write_str(name).expect("write");
        let file = registry
            .add_file(
                NewFile::new(child.path(), format!("{name}.dat"), "alpha")
                    .registered_at(in_bucket(100) + Duration::seconds(i as i64)),
            )
            .expect("add")
            .into_file();
        ids.push(file);
    }
    // a: copied + removed, b: copied, c: exhausted, d: pending
    registry
        .mark_copied(ids[0].id, &ids[0].local_checksum, now)
        .expect("copy a");
    registry.mark_removed(ids[0].id, now).expect("remove a");
    registry
        .mark_copied(ids[1].id, &ids[1].local_checksum, now)
        .expect("copy b");
    for _ in 0..5 {
        registry.record_failed_attempt(ids[2].id, None).expect("fail c");
    }

    let stats = registry
        .archive_stats_at(&alpha(), 5, now)
        .expect("stats");
    assert_eq!(stats.total_files, 4);
    assert_eq!(stats.copied, 2);
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.permanently_failed, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.buckets, 1);
    assert_eq!(stats.finalized_buckets, 0);
    assert_eq!(stats.last_file_added.as_deref(), Some(ids[3].local_path.as_path()));
    assert_eq!(
        stats.finalized_until,
        ids[2].created_at - Duration::seconds(1),
        "oldest uncopied file bounds finalized_until"
    );
}

#[test]
fn hash_is_taken_at_registration() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let data = home.child("data/a.dat");
    data.write_str("v1").expect("write");
    let registry = open(&home);
    let file = registry
        .add_file(NewFile::new(data.path(), "a.dat", "alpha"))
        .expect("add")
        .into_file();

    data.write_str("v2").expect("rewrite");
    assert_ne!(
        checksum::hash_file(data.path()).expect("hash"),
        file.local_checksum,
        "stored digest reflects content at registration time"
    );
}

// ---------------------------------------------------------------------------
// 4. Ignored files
// ---------------------------------------------------------------------------

#[test]
fn ignored_file_leaves_worker_queue_and_stops_bounding_finalized_until() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let registry = open(&home);
    let now = in_bucket(200);

    let stuck = home.child("data/stuck.dat");
    stuck.write_str("stuck").expect("write");
    let stuck = registry
        .add_file(NewFile::new(stuck.path(), "stuck.dat", "alpha").registered_at(in_bucket(100)))
        .expect("add stuck")
        .into_file();
    let later = home.child("data/later.dat");
    later.write_str("later").expect("write");
    let later = registry
        .add_file(
            NewFile::new(later.path(), "later.dat", "alpha")
                .registered_at(in_bucket(100) + Duration::seconds(5)),
        )
        .expect("add later")
        .into_file();

    assert_eq!(
        registry.finalized_until_at(&alpha(), now).expect("until"),
        stuck.created_at - Duration::seconds(1)
    );

    let flagged = registry.set_ignored(&stuck.local_path, true).expect("ignore");
    assert!(flagged.ignored);
    assert_eq!(flagged.state(5), FileState::Ignored);

    let queue = registry.copyable_files(&alpha(), 5, None).expect("queue");
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, later.id);
    assert_eq!(
        registry.finalized_until_at(&alpha(), now).expect("until"),
        later.created_at - Duration::seconds(1),
        "ignored file no longer holds finalized_until back"
    );

    let stats = registry.archive_stats_at(&alpha(), 5, now).expect("stats");
    assert_eq!(stats.total_files, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.ignored, 1);

    let restored = registry.set_ignored(&stuck.local_path, false).expect("undo");
    assert!(!restored.ignored);
    assert_eq!(registry.copyable_files(&alpha(), 5, None).expect("queue").len(), 2);
}

#[test]
fn ignoring_unknown_file_is_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let registry = open(&home);
    let err = registry
        .set_ignored(home.child("ghost.dat").path(), true)
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }), "got: {err}");
}
