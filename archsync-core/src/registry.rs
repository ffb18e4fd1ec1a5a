//! SQLite file registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.archsync/
//!   registry.db      (sync_files + timecode_buckets, WAL journal)
//! ```
//!
//! # Transaction model
//!
//! Every mutation is a single statement or a single transaction keyed by
//! `local_path` / row id (files) or `(archive_name, timecode)` (buckets).
//! Nothing is cached between calls; a crashed caller resumes from whatever
//! was last committed.
//!
//! Time-dependent operations come in two forms:
//! - `fn_at(…, now)`: explicit clock; used in tests
//! - `fn(…)`: uses `Utc::now()`, delegates to `_at`

use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::checksum::{self, Checksum};
use crate::error::{io_err, RegistryError};
use crate::timecode::Timecode;
use crate::types::{
    ArchiveName, ArchiveStats, BucketSummary, NewFile, Registration, SyncFile, TimecodeBucket,
};

const LATEST_SCHEMA_VERSION: i64 = 2;

const FILE_COLUMNS: &str = "id, local_path, remote_path, archive_name, local_checksum, \
     remote_checksum, copied, failed_copy_attempts, removed, deletable, timecode, \
     created_at, copied_at, removed_at, ignored";

const BUCKET_COLUMNS: &str = "archive_name, timecode, complete, synced, finalized, \
     file_count, subdirectories, finalize_file_id, finalized_at";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.archsync/registry.db`: pure, no I/O.
pub fn db_path_at(home: &Path) -> PathBuf {
    home.join(".archsync").join("registry.db")
}

/// `db_path_at` convenience wrapper.
pub fn db_path() -> Result<PathBuf, RegistryError> {
    Ok(db_path_at(&home()?))
}

// ---------------------------------------------------------------------------
// 2. Open / migrate
// ---------------------------------------------------------------------------

/// Handle to the shared registry database. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Open (creating if needed) the registry at `path` and apply migrations.
    pub fn open_at(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut conn = Connection::open(path)?;
        // Producers and workers open the same file from separate processes.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// `open_at` on the default path under the home directory.
    pub fn open() -> Result<Self, RegistryError> {
        Self::open_at(&db_path()?)
    }

    /// Private in-memory registry.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }
}

fn migrate(conn: &mut Connection) -> Result<(), RegistryError> {
    let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(RegistryError::SchemaTooNew {
            found: current,
            supported: LATEST_SCHEMA_VERSION,
        });
    }
    if current < 1 {
        let tx = conn.transaction()?;
        tx.execute_batch(include_str!("../migrations/0001_init.sql"))?;
        tx.pragma_update(None, "user_version", 1i64)?;
        tx.commit()?;
        tracing::debug!("applied registry migration 0001");
    }
    if current < 2 {
        let tx = conn.transaction()?;
        tx.execute_batch(include_str!("../migrations/0002_ignored.sql"))?;
        tx.pragma_update(None, "user_version", 2i64)?;
        tx.commit()?;
        tracing::debug!("applied registry migration 0002");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 3. Registration API
// ---------------------------------------------------------------------------

impl Registry {
    /// Register a file for syncing. The local file is hashed now; that digest
    /// is the reference for every later verification.
    ///
    /// Idempotent on `local_path`: a second call returns
    /// [`Registration::AlreadyRegistered`] and leaves sync state untouched.
    pub fn add_file(&self, new: NewFile) -> Result<Registration, RegistryError> {
        self.add_file_at(new, Utc::now())
    }

    pub fn add_file_at(
        &self,
        new: NewFile,
        now: DateTime<Utc>,
    ) -> Result<Registration, RegistryError> {
        validate_new_file(&new)?;
        if let Some(existing) = self.get_file(&new.local_path)? {
            note_reregistration(&new, &existing);
            return Ok(Registration::AlreadyRegistered(existing));
        }

        let checksum = hash_local(&new.local_path)?;
        let registered_at = new.registered_at.unwrap_or(now);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let registration = insert_file(&tx, &new, &checksum, registered_at)?;
        tx.commit()?;

        if let Registration::Added(file) = &registration {
            tracing::debug!(
                archive = %file.archive_name,
                path = %file.local_path.display(),
                timecode = %file.timecode,
                "registered file",
            );
        }
        Ok(registration)
    }

    /// Re-point a row at a moved or renamed local file.
    ///
    /// The file at `new_local_path` must hash to the stored `local_checksum`;
    /// only `local_path` changes, sync state is kept as is.
    pub fn correct_local_path(
        &self,
        old_local_path: &Path,
        new_local_path: &Path,
    ) -> Result<SyncFile, RegistryError> {
        if !new_local_path.is_absolute() {
            return Err(RegistryError::Validation(format!(
                "local path must be absolute: {}",
                new_local_path.display()
            )));
        }
        let new_str = path_str(new_local_path)?;

        let existing = self
            .get_file(old_local_path)?
            .ok_or_else(|| RegistryError::NotFound {
                path: old_local_path.to_path_buf(),
            })?;
        if existing.removed {
            return Err(RegistryError::Validation(format!(
                "{} was already removed locally",
                old_local_path.display()
            )));
        }
        if self.get_file(new_local_path)?.is_some() {
            return Err(RegistryError::Validation(format!(
                "{} is already registered",
                new_local_path.display()
            )));
        }

        let checksum = hash_local(new_local_path)?;
        if checksum != existing.local_checksum {
            return Err(RegistryError::Validation(format!(
                "checksum of {} ({checksum}) does not match registered {} ({})",
                new_local_path.display(),
                old_local_path.display(),
                existing.local_checksum,
            )));
        }

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sync_files SET local_path = ?1 WHERE id = ?2",
            params![new_str, existing.id],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound {
                path: old_local_path.to_path_buf(),
            });
        }
        let updated = load_file_by_id(&conn, existing.id)?.ok_or_else(|| {
            RegistryError::NotFound {
                path: new_local_path.to_path_buf(),
            }
        })?;
        tracing::info!(
            from = %old_local_path.display(),
            to = %new_local_path.display(),
            "corrected local path",
        );
        Ok(updated)
    }

    /// Rows in `archive` whose registered content hashes to `checksum`.
    pub fn find_by_checksum(
        &self,
        archive: &ArchiveName,
        checksum: &Checksum,
    ) -> Result<Vec<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM sync_files \
                 WHERE archive_name = ?1 AND local_checksum = ?2 ORDER BY id"
            ),
            params![archive.as_str(), checksum.as_str()],
        )
    }

    pub fn get_file(&self, local_path: &Path) -> Result<Option<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        load_file_by_path(&conn, local_path)
    }

    pub fn get_file_by_id(&self, id: i64) -> Result<Option<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        load_file_by_id(&conn, id)
    }

    /// Set or clear the operator `ignored` flag. Copied rows keep their state;
    /// the flag only affects files still outstanding.
    pub fn set_ignored(&self, local_path: &Path, ignored: bool) -> Result<SyncFile, RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sync_files SET ignored = ?2 WHERE local_path = ?1",
            params![path_str(local_path)?, ignored],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound {
                path: local_path.to_path_buf(),
            });
        }
        let file = load_file_by_path(&conn, local_path)?.ok_or_else(|| RegistryError::NotFound {
            path: local_path.to_path_buf(),
        })?;
        tracing::info!(
            archive = %file.archive_name,
            path = %local_path.display(),
            ignored,
            "updated ignore flag",
        );
        Ok(file)
    }
}

// ---------------------------------------------------------------------------
// 4. Copy / verify / delete bookkeeping
// ---------------------------------------------------------------------------

impl Registry {
    /// Oldest-first batch of files still eligible for a copy attempt.
    pub fn copyable_files(
        &self,
        archive: &ArchiveName,
        max_copy_attempts: u32,
        limit: Option<usize>,
    ) -> Result<Vec<SyncFile>, RegistryError> {
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let conn = self.lock()?;
        query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM sync_files \
                 WHERE archive_name = ?1 AND copied = 0 AND removed = 0 AND ignored = 0 \
                   AND failed_copy_attempts < ?2 \
                 ORDER BY created_at ASC, id ASC LIMIT ?3"
            ),
            params![archive.as_str(), max_copy_attempts, limit],
        )
    }

    /// Record a verified copy. Refuses unless `remote` equals the stored
    /// local checksum, so `copied = 1` always implies a matching digest.
    pub fn mark_copied(
        &self,
        id: i64,
        remote: &Checksum,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sync_files SET copied = 1, copied_at = ?1, remote_checksum = ?2 \
             WHERE id = ?3 AND copied = 0 AND local_checksum = ?2",
            params![at.timestamp_millis(), remote.as_str(), id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        match load_file_by_id(&conn, id)? {
            None => Err(missing_row(id)),
            Some(file) if file.copied => Ok(()),
            Some(file) => Err(RegistryError::Validation(format!(
                "remote checksum {remote} does not match local {} for {}",
                file.local_checksum,
                file.local_path.display()
            ))),
        }
    }

    /// Count one failed copy or verification. Returns the new attempt count.
    pub fn record_failed_attempt(
        &self,
        id: i64,
        remote: Option<&Checksum>,
    ) -> Result<u32, RegistryError> {
        let conn = self.lock()?;
        let attempts = conn
            .query_row(
                "UPDATE sync_files \
                 SET failed_copy_attempts = failed_copy_attempts + 1, \
                     remote_checksum = COALESCE(?2, remote_checksum) \
                 WHERE id = ?1 AND copied = 0 \
                 RETURNING failed_copy_attempts",
                params![id, remote.map(Checksum::as_str)],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        match attempts {
            Some(n) => Ok(n),
            None => load_file_by_id(&conn, id)?
                .map(|file| file.failed_copy_attempts)
                .ok_or_else(|| missing_row(id)),
        }
    }

    /// Copied, deletable files still present locally whose `copied_at` is
    /// strictly before `cutoff`.
    pub fn deletable_files(
        &self,
        archive: &ArchiveName,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM sync_files \
                 WHERE archive_name = ?1 AND copied = 1 AND removed = 0 AND deletable = 1 \
                   AND copied_at < ?2 \
                 ORDER BY copied_at ASC, id ASC"
            ),
            params![archive.as_str(), cutoff.timestamp_millis()],
        )
    }

    /// Record that the local bytes are gone. Only copied rows qualify.
    pub fn mark_removed(&self, id: i64, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sync_files SET removed = 1, removed_at = ?1 \
             WHERE id = ?2 AND copied = 1 AND removed = 0",
            params![at.timestamp_millis(), id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        match load_file_by_id(&conn, id)? {
            None => Err(missing_row(id)),
            Some(file) if file.removed => Ok(()),
            Some(file) => Err(RegistryError::Validation(format!(
                "refusing to mark uncopied file {} as removed",
                file.local_path.display()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// 5. Timecode buckets
// ---------------------------------------------------------------------------

impl Registry {
    pub fn bucket(
        &self,
        archive: &ArchiveName,
        timecode: Timecode,
    ) -> Result<Option<TimecodeBucket>, RegistryError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {BUCKET_COLUMNS} FROM timecode_buckets \
                 WHERE archive_name = ?1 AND timecode = ?2"
            ),
            params![archive.as_str(), timecode.0],
            bucket_from_row,
        )
        .optional()
        .map_err(RegistryError::from)
    }

    /// All buckets of `archive`, oldest timecode first.
    pub fn buckets(&self, archive: &ArchiveName) -> Result<Vec<TimecodeBucket>, RegistryError> {
        self.query_buckets(archive, "")
    }

    /// Buckets still awaiting finalization, oldest first.
    pub fn open_buckets(
        &self,
        archive: &ArchiveName,
    ) -> Result<Vec<TimecodeBucket>, RegistryError> {
        self.query_buckets(archive, "AND finalized = 0")
    }

    fn query_buckets(
        &self,
        archive: &ArchiveName,
        filter: &str,
    ) -> Result<Vec<TimecodeBucket>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUCKET_COLUMNS} FROM timecode_buckets \
             WHERE archive_name = ?1 {filter} ORDER BY timecode ASC"
        ))?;
        let rows = stmt.query_map(params![archive.as_str()], bucket_from_row)?;
        let buckets = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    /// Whether any file in `archive` belongs to a timecode after `timecode`.
    pub fn has_newer_file(
        &self,
        archive: &ArchiveName,
        timecode: Timecode,
    ) -> Result<bool, RegistryError> {
        let conn = self.lock()?;
        let exists = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sync_files WHERE archive_name = ?1 AND timecode > ?2)",
            params![archive.as_str(), timecode.0],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(exists)
    }

    pub fn bucket_files(
        &self,
        archive: &ArchiveName,
        timecode: Timecode,
    ) -> Result<Vec<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM sync_files \
                 WHERE archive_name = ?1 AND timecode = ?2 ORDER BY created_at ASC, id ASC"
            ),
            params![archive.as_str(), timecode.0],
        )
    }

    /// Persist the completeness and sync flags of an unfinalized bucket.
    pub fn set_bucket_flags(
        &self,
        archive: &ArchiveName,
        timecode: Timecode,
        complete: bool,
        synced: bool,
    ) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE timecode_buckets SET complete = ?3, synced = ?4 \
             WHERE archive_name = ?1 AND timecode = ?2 AND finalized = 0",
            params![archive.as_str(), timecode.0, complete, synced],
        )?;
        Ok(())
    }

    /// Register the finalization record and mark the bucket finalized in one
    /// immediate transaction.
    ///
    /// Returns `Ok(None)` without writing anything if the bucket was already
    /// finalized, so at most one record is ever registered per bucket.
    pub fn finalize_bucket_at(
        &self,
        archive: &ArchiveName,
        timecode: Timecode,
        summary: &BucketSummary,
        record: NewFile,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncFile>, RegistryError> {
        validate_new_file(&record)?;
        let checksum = hash_local(&record.local_path)?;
        let registered_at = record.registered_at.unwrap_or(now);
        let subdirectories = serde_json::to_string(&summary.subdirectories)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let finalized: Option<bool> = tx
            .query_row(
                "SELECT finalized FROM timecode_buckets WHERE archive_name = ?1 AND timecode = ?2",
                params![archive.as_str(), timecode.0],
                |row| row.get(0),
            )
            .optional()?;
        match finalized {
            None => {
                return Err(RegistryError::BucketNotFound {
                    archive: archive.0.clone(),
                    timecode: timecode.0,
                })
            }
            Some(true) => return Ok(None),
            Some(false) => {}
        }

        let file = insert_file(&tx, &record, &checksum, registered_at)?.into_file();
        tx.execute(
            "UPDATE timecode_buckets \
             SET complete = 1, synced = 1, finalized = 1, file_count = ?3, \
                 subdirectories = ?4, finalize_file_id = ?5, finalized_at = ?6 \
             WHERE archive_name = ?1 AND timecode = ?2",
            params![
                archive.as_str(),
                timecode.0,
                summary.file_count as i64,
                subdirectories,
                file.id,
                summary.finalized_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(Some(file))
    }
}

// ---------------------------------------------------------------------------
// 6. Operator queries
// ---------------------------------------------------------------------------

impl Registry {
    /// Distinct archive names present in the registry.
    pub fn archives(&self) -> Result<Vec<ArchiveName>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT archive_name FROM sync_files \
             UNION SELECT archive_name FROM timecode_buckets ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let names = rows
            .map(|r| r.map(ArchiveName::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Every file of `archive`, oldest first.
    pub fn files(&self, archive: &ArchiveName) -> Result<Vec<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM sync_files \
                 WHERE archive_name = ?1 ORDER BY created_at ASC, id ASC"
            ),
            params![archive.as_str()],
        )
    }

    /// Files that exhausted their copy attempts. Never purged.
    pub fn permanently_failed(
        &self,
        archive: &ArchiveName,
        max_copy_attempts: u32,
    ) -> Result<Vec<SyncFile>, RegistryError> {
        let conn = self.lock()?;
        query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM sync_files \
                 WHERE archive_name = ?1 AND copied = 0 AND ignored = 0 \
                   AND failed_copy_attempts >= ?2 \
                 ORDER BY created_at ASC, id ASC"
            ),
            params![archive.as_str(), max_copy_attempts],
        )
    }

    /// Moment before which every registered, non-ignored file of `archive`
    /// is copied. `now` when nothing is outstanding.
    pub fn finalized_until_at(
        &self,
        archive: &ArchiveName,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let conn = self.lock()?;
        finalized_until(&conn, archive, now)
    }

    pub fn archive_stats(
        &self,
        archive: &ArchiveName,
        max_copy_attempts: u32,
    ) -> Result<ArchiveStats, RegistryError> {
        self.archive_stats_at(archive, max_copy_attempts, Utc::now())
    }

    pub fn archive_stats_at(
        &self,
        archive: &ArchiveName,
        max_copy_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ArchiveStats, RegistryError> {
        let conn = self.lock()?;
        let (total, copied, removed, failed, pending, ignored) = conn.query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(copied), 0), \
                    COALESCE(SUM(removed), 0), \
                    COALESCE(SUM(copied = 0 AND ignored = 0 AND failed_copy_attempts >= ?2), 0), \
                    COALESCE(SUM(copied = 0 AND ignored = 0 AND failed_copy_attempts < ?2), 0), \
                    COALESCE(SUM(copied = 0 AND ignored = 1), 0) \
             FROM sync_files WHERE archive_name = ?1",
            params![archive.as_str(), max_copy_attempts],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;
        let (buckets, finalized_buckets) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(finalized), 0) \
             FROM timecode_buckets WHERE archive_name = ?1",
            params![archive.as_str()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let last_file_added: Option<String> = conn
            .query_row(
                "SELECT local_path FROM sync_files WHERE archive_name = ?1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![archive.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let last_file_copied: Option<String> = conn
            .query_row(
                "SELECT local_path FROM sync_files WHERE archive_name = ?1 AND copied = 1 \
                 ORDER BY copied_at DESC, id DESC LIMIT 1",
                params![archive.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(ArchiveStats {
            archive_name: archive.clone(),
            total_files: total.max(0) as u64,
            copied: copied.max(0) as u64,
            pending: pending.max(0) as u64,
            permanently_failed: failed.max(0) as u64,
            removed: removed.max(0) as u64,
            ignored: ignored.max(0) as u64,
            buckets: buckets.max(0) as u64,
            finalized_buckets: finalized_buckets.max(0) as u64,
            last_file_added: last_file_added.map(PathBuf::from),
            last_file_copied: last_file_copied.map(PathBuf::from),
            finalized_until: finalized_until(&conn, archive, now)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

fn insert_file(
    conn: &Connection,
    new: &NewFile,
    checksum: &Checksum,
    registered_at: DateTime<Utc>,
) -> Result<Registration, RegistryError> {
    let timecode = Timecode::from_datetime(registered_at);
    let inserted = conn.execute(
        "INSERT INTO sync_files \
             (local_path, remote_path, archive_name, local_checksum, deletable, timecode, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT (local_path) DO NOTHING",
        params![
            path_str(&new.local_path)?,
            path_str(&new.remote_path)?,
            new.archive_name.as_str(),
            checksum.as_str(),
            new.deletable,
            timecode.0,
            registered_at.timestamp_millis(),
        ],
    )?;
    if inserted == 0 {
        let existing =
            load_file_by_path(conn, &new.local_path)?.ok_or_else(|| RegistryError::NotFound {
                path: new.local_path.clone(),
            })?;
        note_reregistration(new, &existing);
        return Ok(Registration::AlreadyRegistered(existing));
    }
    let id = conn.last_insert_rowid();

    conn.execute(
        "INSERT OR IGNORE INTO timecode_buckets (archive_name, timecode) VALUES (?1, ?2)",
        params![new.archive_name.as_str(), timecode.0],
    )?;
    let bucket_finalized: bool = conn.query_row(
        "SELECT finalized FROM timecode_buckets WHERE archive_name = ?1 AND timecode = ?2",
        params![new.archive_name.as_str(), timecode.0],
        |row| row.get(0),
    )?;
    if bucket_finalized {
        tracing::warn!(
            archive = %new.archive_name,
            timecode = %timecode,
            path = %new.local_path.display(),
            "file registered into an already finalized timecode bucket",
        );
    }

    let file = load_file_by_id(conn, id)?.ok_or_else(|| missing_row(id))?;
    Ok(Registration::Added(file))
}

fn note_reregistration(new: &NewFile, existing: &SyncFile) {
    if existing.remote_path != new.remote_path || existing.archive_name != new.archive_name {
        tracing::warn!(
            path = %new.local_path.display(),
            registered_remote = %existing.remote_path.display(),
            requested_remote = %new.remote_path.display(),
            registered_archive = %existing.archive_name,
            requested_archive = %new.archive_name,
            "file already registered with different destination; keeping existing row",
        );
    }
}

fn validate_new_file(new: &NewFile) -> Result<(), RegistryError> {
    new.archive_name
        .validate()
        .map_err(RegistryError::Validation)?;

    if !new.local_path.is_absolute() {
        return Err(RegistryError::Validation(format!(
            "local path must be absolute: {}",
            new.local_path.display()
        )));
    }
    path_str(&new.local_path)?;

    if new.remote_path.as_os_str().is_empty() {
        return Err(RegistryError::Validation(
            "remote path must not be empty".to_string(),
        ));
    }
    path_str(&new.remote_path)?;
    if new
        .remote_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(RegistryError::Validation(format!(
            "remote path must be relative without '..': {}",
            new.remote_path.display()
        )));
    }
    Ok(())
}

fn hash_local(path: &Path) -> Result<Checksum, RegistryError> {
    let meta = std::fs::metadata(path).map_err(|e| not_found_or_io(path, e))?;
    if !meta.is_file() {
        return Err(RegistryError::Validation(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    checksum::hash_file(path).map_err(|e| not_found_or_io(path, e))
}

fn not_found_or_io(path: &Path, err: std::io::Error) -> RegistryError {
    if err.kind() == ErrorKind::NotFound {
        RegistryError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        io_err(path, err)
    }
}

fn path_str(path: &Path) -> Result<&str, RegistryError> {
    path.to_str().ok_or_else(|| {
        RegistryError::Validation(format!("path is not valid UTF-8: {}", path.display()))
    })
}

fn missing_row(id: i64) -> RegistryError {
    RegistryError::NotFound {
        path: PathBuf::from(format!("sync_files#{id}")),
    }
}

fn finalized_until(
    conn: &Connection,
    archive: &ArchiveName,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, RegistryError> {
    let oldest_pending: Option<i64> = conn.query_row(
        "SELECT MIN(created_at) FROM sync_files \
         WHERE archive_name = ?1 AND copied = 0 AND ignored = 0",
        params![archive.as_str()],
        |row| row.get(0),
    )?;
    Ok(match oldest_pending {
        Some(ms) => millis_to_datetime(ms - 1_000).unwrap_or(now),
        None => now,
    })
}

fn load_file_by_path(
    conn: &Connection,
    local_path: &Path,
) -> Result<Option<SyncFile>, RegistryError> {
    let Some(local) = local_path.to_str() else {
        return Ok(None);
    };
    conn.query_row(
        &format!("SELECT {FILE_COLUMNS} FROM sync_files WHERE local_path = ?1"),
        params![local],
        file_from_row,
    )
    .optional()
    .map_err(RegistryError::from)
}

fn load_file_by_id(conn: &Connection, id: i64) -> Result<Option<SyncFile>, RegistryError> {
    conn.query_row(
        &format!("SELECT {FILE_COLUMNS} FROM sync_files WHERE id = ?1"),
        params![id],
        file_from_row,
    )
    .optional()
    .map_err(RegistryError::from)
}

fn query_files<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<SyncFile>, RegistryError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, file_from_row)?;
    let files = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<SyncFile> {
    Ok(SyncFile {
        id: row.get(0)?,
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        remote_path: PathBuf::from(row.get::<_, String>(2)?),
        archive_name: ArchiveName(row.get(3)?),
        local_checksum: Checksum(row.get(4)?),
        remote_checksum: row.get::<_, Option<String>>(5)?.map(Checksum),
        copied: row.get(6)?,
        failed_copy_attempts: row.get(7)?,
        removed: row.get(8)?,
        deletable: row.get(9)?,
        timecode: Timecode(row.get(10)?),
        created_at: datetime_col(row, 11)?,
        copied_at: opt_datetime_col(row, 12)?,
        removed_at: opt_datetime_col(row, 13)?,
        ignored: row.get(14)?,
    })
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<TimecodeBucket> {
    let subdirs: String = row.get(6)?;
    let subdirectories: Vec<String> = serde_json::from_str(&subdirs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(TimecodeBucket {
        archive_name: ArchiveName(row.get(0)?),
        timecode: Timecode(row.get(1)?),
        complete: row.get(2)?,
        synced: row.get(3)?,
        finalized: row.get(4)?,
        file_count: row.get::<_, i64>(5)?.max(0) as u64,
        subdirectories,
        finalize_file_id: row.get(7)?,
        finalized_at: opt_datetime_col(row, 8)?,
    })
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn datetime_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    millis_to_datetime(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn opt_datetime_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(_) => datetime_col(row, idx).map(Some),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
