//! SQLite-backed status record store.
//!
//! Status records are stored as JSON documents keyed by their deterministic
//! name, each with a monotonically increasing revision used for optimistic
//! concurrency. Every successful write also appends a snapshot to
//! `status_record_changes`, which is the change feed the evaluator tails
//! (see [`crate::feed`]).
//!
//! The same database holds the pipeline activities consulted by the
//! reconciler and the submitted workload events.
//!
//! # Schema
//!
//! ```sql
//! status_records(name PK, revision, last_commit_sha, record_json, updated_at)
//! status_record_changes(seq PK AUTOINCREMENT, name, revision, record_json, created_at)
//! pipeline_activities(name PK, kind, uid, api_version, updated_at)
//! workload_events(seq PK AUTOINCREMENT, workload_name, payload_json, created_at)
//! feed_watermarks(feed_id PK, last_seq, updated_at)
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use commitstatus_core::status::{PipelineActivityRef, RecordError, StatusRecord, SubCheck};
use commitstatus_core::WorkloadInstance;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use thiserror::Error;
use tracing::debug;

/// Schema SQL for the controller database.
const SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS status_records (
        name TEXT PRIMARY KEY,
        revision INTEGER NOT NULL,
        last_commit_sha TEXT,
        record_json TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS status_record_changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        revision INTEGER NOT NULL,
        record_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_record_changes_name ON status_record_changes(name);

    CREATE TABLE IF NOT EXISTS pipeline_activities (
        name TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        uid TEXT NOT NULL,
        api_version TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workload_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        workload_name TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS feed_watermarks (
        feed_id TEXT PRIMARY KEY,
        last_seq INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

// =============================================================================
// Error Types
// =============================================================================

/// Errors returned by the record store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// A record with this name already exists.
    #[error("status record {name} already exists")]
    AlreadyExists {
        /// Record name.
        name: String,
    },

    /// The stored revision moved since the record was read.
    #[error("status record {name} was modified concurrently (expected revision {expected}, found {actual})")]
    Conflict {
        /// Record name.
        name: String,
        /// Revision the caller read.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },

    /// No record with this name exists.
    #[error("status record {name} not found")]
    NotFound {
        /// Record name.
        name: String,
    },

    /// The record holds no detail for this sha.
    #[error("status record {name} has no detail for sha {sha}")]
    DetailNotFound {
        /// Record name.
        name: String,
        /// Commit sha.
        sha: String,
    },

    /// The record violates a data-integrity invariant.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// A stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true when the write lost a race and a re-read may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

// =============================================================================
// Traits
// =============================================================================

/// A stored value with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// The stored value.
    pub value: T,
    /// Revision of the value; starts at 1 and increases on every write.
    pub revision: u64,
}

/// Durable storage for status records.
///
/// Writes are conditional: `create` fails if the name is taken and `update`
/// fails unless the stored revision equals `expected_revision`. Callers
/// resolve both by re-reading and reapplying their change.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetches a record by name.
    async fn get(&self, name: &str) -> Result<Option<Versioned<StatusRecord>>, StoreError>;

    /// Creates a record, returning its revision.
    async fn create(&self, record: &StatusRecord) -> Result<u64, StoreError>;

    /// Replaces a record if it is still at `expected_revision`, returning the
    /// new revision.
    async fn update(&self, record: &StatusRecord, expected_revision: u64)
    -> Result<u64, StoreError>;
}

/// Lookup of pipeline activities by name.
#[async_trait]
pub trait ActivityLookup: Send + Sync {
    /// Fetches the activity reference stored under `name`.
    async fn get_activity(&self, name: &str) -> Result<Option<PipelineActivityRef>, StoreError>;
}

// =============================================================================
// SqliteStore
// =============================================================================

/// `SQLite` implementation of [`RecordStore`] and [`ActivityLookup`].
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be opened or
    /// migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    /// Wraps an open connection, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be created.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Returns the shared connection, for feeds tailing this database.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(format!("mutex poisoned: {e}")))
    }

    /// Runs `f` against this store on the blocking thread pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }

    /// Fetches a record by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database or decoding failure.
    pub fn load_record(&self, name: &str) -> Result<Option<Versioned<StatusRecord>>, StoreError> {
        let conn = self.lock()?;
        read_record(&conn, name)
    }

    /// Creates a record, returning its revision (always 1).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the name is taken, or
    /// [`StoreError::Record`] if the record is invalid.
    pub fn insert_record(&self, record: &StatusRecord) -> Result<u64, StoreError> {
        record.validate()?;
        let json = encode(record)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM status_records WHERE name = ?1",
                params![&record.name],
                |_| Ok(true),
            )
            .optional()
            .map_err(db_err)?
            .unwrap_or(false);
        if exists {
            return Err(StoreError::AlreadyExists {
                name: record.name.clone(),
            });
        }

        tx.execute(
            "INSERT INTO status_records (name, revision, last_commit_sha, record_json, updated_at)
             VALUES (?1, 1, ?2, ?3, ?4)",
            params![&record.name, record.last_commit_sha(), &json, now_secs()],
        )
        .map_err(db_err)?;
        append_change(&tx, &record.name, 1, &json)?;
        tx.commit().map_err(db_err)?;

        debug!(record = %record.name, "status record created");
        Ok(1)
    }

    /// Replaces a record if it is still at `expected_revision`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on a revision mismatch,
    /// [`StoreError::NotFound`] if the record does not exist, or
    /// [`StoreError::Record`] if the record is invalid.
    pub fn replace_record(
        &self,
        record: &StatusRecord,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        record.validate()?;
        let json = encode(record)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let revision = write_revision(&tx, record, &json, expected_revision)?;
        tx.commit().map_err(db_err)?;

        debug!(record = %record.name, revision, "status record updated");
        Ok(revision)
    }

    /// Records the outcome of a context's check for one commit.
    ///
    /// Marks the detail for `sha` as checked and replaces its sub-checks.
    /// The read and write happen in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::DetailNotFound`]
    /// when there is nothing to update.
    pub fn record_check_results(
        &self,
        name: &str,
        sha: &str,
        checks: Vec<SubCheck>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let Some(Versioned {
            value: mut record,
            revision,
        }) = read_record(&tx, name)?
        else {
            return Err(StoreError::NotFound {
                name: name.to_string(),
            });
        };

        let index = record
            .details
            .iter()
            .position(|d| d.commit.sha == sha)
            .ok_or_else(|| StoreError::DetailNotFound {
                name: name.to_string(),
                sha: sha.to_string(),
            })?;

        let detail = &mut record.details[index];
        detail.checked = true;
        detail.sub_checks = checks;
        record.touch_last_commit_sha(index);
        record.validate()?;

        let json = encode(&record)?;
        let new_revision = write_revision(&tx, &record, &json, revision)?;
        tx.commit().map_err(db_err)?;

        debug!(record = %name, sha = %sha, revision = new_revision, "check results recorded");
        Ok(new_revision)
    }

    /// Inserts or replaces a pipeline activity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub fn upsert_activity(&self, activity: &PipelineActivityRef) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO pipeline_activities (name, kind, uid, api_version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &activity.name,
                &activity.kind,
                &activity.uid,
                &activity.api_version,
                now_secs()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Fetches a pipeline activity by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on read failure.
    pub fn load_activity(&self, name: &str) -> Result<Option<PipelineActivityRef>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT name, kind, uid, api_version FROM pipeline_activities WHERE name = ?1",
            params![name],
            |row| {
                Ok(PipelineActivityRef {
                    name: row.get(0)?,
                    kind: row.get(1)?,
                    uid: row.get(2)?,
                    api_version: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Appends a workload instance to the workload event feed, returning its
    /// sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on encoding or write failure.
    #[allow(clippy::cast_sign_loss)]
    pub fn append_workload_event(&self, workload: &WorkloadInstance) -> Result<u64, StoreError> {
        let json = serde_json::to_string(workload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO workload_events (workload_name, payload_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![&workload.name, &json, now_secs()],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid() as u64)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, name: &str) -> Result<Option<Versioned<StatusRecord>>, StoreError> {
        let name = name.to_string();
        self.blocking(move |store| store.load_record(&name)).await
    }

    async fn create(&self, record: &StatusRecord) -> Result<u64, StoreError> {
        let record = record.clone();
        self.blocking(move |store| store.insert_record(&record))
            .await
    }

    async fn update(
        &self,
        record: &StatusRecord,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        let record = record.clone();
        self.blocking(move |store| store.replace_record(&record, expected_revision))
            .await
    }
}

#[async_trait]
impl ActivityLookup for SqliteStore {
    async fn get_activity(&self, name: &str) -> Result<Option<PipelineActivityRef>, StoreError> {
        let name = name.to_string();
        self.blocking(move |store| store.load_activity(&name)).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

#[allow(clippy::cast_sign_loss)]
fn read_record(
    conn: &Connection,
    name: &str,
) -> Result<Option<Versioned<StatusRecord>>, StoreError> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT revision, record_json FROM status_records WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;

    row.map(|(revision, json)| {
        let value: StatusRecord =
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Versioned {
            value,
            revision: revision as u64,
        })
    })
    .transpose()
}

/// Conditionally bumps the revision of an existing record.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn write_revision(
    tx: &Transaction<'_>,
    record: &StatusRecord,
    json: &str,
    expected_revision: u64,
) -> Result<u64, StoreError> {
    let changed = tx
        .execute(
            "UPDATE status_records
             SET revision = revision + 1, last_commit_sha = ?1, record_json = ?2, updated_at = ?3
             WHERE name = ?4 AND revision = ?5",
            params![
                record.last_commit_sha(),
                json,
                now_secs(),
                &record.name,
                expected_revision as i64
            ],
        )
        .map_err(db_err)?;

    if changed == 0 {
        let actual: Option<i64> = tx
            .query_row(
                "SELECT revision FROM status_records WHERE name = ?1",
                params![&record.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        return Err(match actual {
            Some(actual) => StoreError::Conflict {
                name: record.name.clone(),
                expected: expected_revision,
                actual: actual as u64,
            },
            None => StoreError::NotFound {
                name: record.name.clone(),
            },
        });
    }

    let revision = expected_revision + 1;
    append_change(tx, &record.name, revision, json)?;
    Ok(revision)
}

#[allow(clippy::cast_possible_wrap)]
fn append_change(conn: &Connection, name: &str, revision: u64, json: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO status_record_changes (name, revision, record_json, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![name, revision as i64, json, now_secs()],
    )
    .map_err(db_err)?;
    Ok(())
}

fn encode(record: &StatusRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[allow(clippy::cast_possible_wrap)] // Timestamp won't overflow until year 2554
pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as i64
}

#[cfg(test)]
mod tests {
    use commitstatus_core::status::{CommitRef, StatusDetail};

    use super::*;

    fn detail(sha: &str) -> StatusDetail {
        StatusDetail::pending(
            CommitRef {
                url: "https://github.com/acme/widgets".to_string(),
                sha: sha.to_string(),
                pull_request: Some("PR-7".to_string()),
            },
            PipelineActivityRef::default(),
            "build",
        )
    }

    fn record(name: &str, sha: &str) -> StatusRecord {
        StatusRecord::new(name, detail(sha)).unwrap()
    }

    fn change_count(store: &SqliteStore) -> i64 {
        let conn = store.connection();
        let conn = conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM status_record_changes", [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn create_then_get() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("acme-widgets-pr-7-build", "abc");

        assert_eq!(store.insert_record(&rec).unwrap(), 1);

        let loaded = store.load_record(&rec.name).unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.value, rec);
        assert_eq!(change_count(&store), 1);
    }

    #[test]
    fn create_existing_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_record(&record("r", "abc")).unwrap();

        let err = store.insert_record(&record("r", "def")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert!(err.is_conflict());
    }

    #[test]
    fn update_with_stale_revision_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rec = record("r", "abc");
        store.insert_record(&rec).unwrap();

        rec.details[0].checked = true;
        assert_eq!(store.replace_record(&rec, 1).unwrap(), 2);

        let err = store.replace_record(&rec, 1).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(change_count(&store), 2);
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.replace_record(&record("r", "abc"), 1).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn duplicate_sha_is_rejected_before_persistence() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rec = record("r", "abc");
        store.insert_record(&rec).unwrap();

        rec.details.push(detail("abc"));
        let err = store.replace_record(&rec, 1).unwrap_err();
        assert!(matches!(err, StoreError::Record(RecordError::DuplicateSha { .. })));

        let stored = store.load_record("r").unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.value.details.len(), 1);
    }

    #[test]
    fn record_check_results_marks_detail_checked() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rec = record("r", "abc");
        rec.details.push(detail("def"));
        store.insert_record(&rec).unwrap();

        let revision = store
            .record_check_results("r", "abc", vec![SubCheck::new("lint", "", false)])
            .unwrap();
        assert_eq!(revision, 2);

        let stored = store.load_record("r").unwrap().unwrap().value;
        assert!(stored.details[0].checked);
        assert_eq!(stored.details[0].sub_checks.len(), 1);
        assert!(!stored.details[1].checked);
        assert_eq!(stored.last_commit_sha(), Some("abc"));
    }

    #[test]
    fn record_check_results_for_unknown_sha() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_record(&record("r", "abc")).unwrap();

        assert!(matches!(
            store.record_check_results("r", "zzz", Vec::new()).unwrap_err(),
            StoreError::DetailNotFound { .. }
        ));
        assert!(matches!(
            store.record_check_results("missing", "abc", Vec::new()).unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn activities_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_activity("acme-widgets-pr-7-1").unwrap().is_none());

        let activity = PipelineActivityRef {
            name: "acme-widgets-pr-7-1".to_string(),
            kind: "PipelineActivity".to_string(),
            uid: "uid-1".to_string(),
            api_version: "jenkins.io/v1".to_string(),
        };
        store.upsert_activity(&activity).unwrap();
        assert_eq!(store.load_activity(&activity.name).unwrap(), Some(activity.clone()));

        let replaced = PipelineActivityRef {
            uid: "uid-2".to_string(),
            ..activity
        };
        store.upsert_activity(&replaced).unwrap();
        assert_eq!(
            store.load_activity(&replaced.name).unwrap().unwrap().uid,
            "uid-2"
        );
    }

    #[test]
    fn workload_events_get_increasing_sequence_numbers() {
        let store = SqliteStore::in_memory().unwrap();
        let workload = WorkloadInstance {
            name: "build-pod".to_string(),
            ..WorkloadInstance::default()
        };

        let first = store.append_workload_event(&workload).unwrap();
        let second = store.append_workload_event(&workload).unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn async_trait_methods_delegate() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("r", "abc");

        assert_eq!(RecordStore::create(&store, &rec).await.unwrap(), 1);
        let loaded = RecordStore::get(&store, "r").await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(RecordStore::update(&store, &loaded.value, 1).await.unwrap(), 2);
        assert!(store.get_activity("nope").await.unwrap().is_none());
    }
}
