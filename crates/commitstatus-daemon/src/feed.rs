//! Event feeds.
//!
//! The controller consumes two independent, append-only feeds stored in the
//! controller database:
//!
//! - `workload_events`: workload instances submitted by the build system
//! - `status_record_changes`: a snapshot of every status record write
//!
//! A [`FeedTailer`] reads one feed in sequence order starting after its
//! persisted watermark.
//!
//! # At-Least-Once Delivery
//!
//! [`FeedTailer::poll`] does NOT advance the watermark. The caller must call
//! [`FeedTailer::acknowledge`] once an entry has been handled; entries that
//! were polled but not acknowledged before a crash are delivered again.
//! Handlers are idempotent, so redelivery is safe.
//!
//! # Retention
//!
//! Acknowledged entries are no longer needed for delivery.
//! [`FeedTailer::evict_acknowledged`] deletes those older than a retention
//! window. Sequence numbers are `AUTOINCREMENT`, so eviction never causes a
//! later entry to reuse a sequence number at or below the watermark.

use std::sync::{Arc, Mutex};

use commitstatus_core::{StatusRecord, WorkloadInstance};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::now_secs;

/// Errors returned by a feed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeedError {
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// An entry could not be decoded.
    #[error("invalid payload at {feed} seq {seq}: {message}")]
    InvalidPayload {
        /// Feed identifier.
        feed: &'static str,
        /// Sequence number of the entry.
        seq: u64,
        /// Decoding failure.
        message: String,
    },
}

/// The feeds a controller consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Submitted workload instances.
    Workloads,
    /// Status record changes.
    StatusRecords,
}

impl FeedKind {
    /// Identifier under which the feed's watermark is persisted.
    #[must_use]
    pub const fn feed_id(self) -> &'static str {
        match self {
            Self::Workloads => "workloads",
            Self::StatusRecords => "status-records",
        }
    }

    const fn poll_sql(self) -> &'static str {
        match self {
            Self::Workloads => {
                "SELECT seq, payload_json FROM workload_events
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
            },
            Self::StatusRecords => {
                "SELECT seq, record_json FROM status_record_changes
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
            },
        }
    }

    const fn evict_sql(self) -> &'static str {
        match self {
            Self::Workloads => "DELETE FROM workload_events WHERE seq <= ?1 AND created_at <= ?2",
            Self::StatusRecords => {
                "DELETE FROM status_record_changes WHERE seq <= ?1 AND created_at <= ?2"
            },
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.feed_id())
    }
}

/// An event delivered to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A workload instance was observed.
    Workload(WorkloadInstance),
    /// A status record was written.
    StatusRecord(StatusRecord),
}

/// One undecoded feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    /// Sequence number within the feed.
    pub seq: u64,
    /// Feed the entry came from.
    pub kind: FeedKind,
    /// JSON payload.
    pub payload: String,
}

impl FeedEntry {
    /// Decodes the payload into a controller event.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::InvalidPayload`] if the JSON does not match the
    /// feed's event shape.
    pub fn decode(&self) -> Result<ControllerEvent, FeedError> {
        let invalid = |e: serde_json::Error| FeedError::InvalidPayload {
            feed: self.kind.feed_id(),
            seq: self.seq,
            message: e.to_string(),
        };
        match self.kind {
            FeedKind::Workloads => serde_json::from_str(&self.payload)
                .map(ControllerEvent::Workload)
                .map_err(invalid),
            FeedKind::StatusRecords => serde_json::from_str(&self.payload)
                .map(ControllerEvent::StatusRecord)
                .map_err(invalid),
        }
    }
}

/// Reads one feed in order, resuming from a persisted watermark.
pub struct FeedTailer {
    conn: Arc<Mutex<Connection>>,
    kind: FeedKind,
    last_seq: u64,
}

impl FeedTailer {
    /// Creates a tailer, loading the persisted watermark if available.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the watermark cannot be read.
    pub fn new(conn: Arc<Mutex<Connection>>, kind: FeedKind) -> Result<Self, FeedError> {
        let last_seq = {
            let guard = lock(&conn)?;
            load_watermark(&guard, kind)?
        };

        if last_seq > 0 {
            info!(feed = %kind, last_seq, "resumed feed from persisted watermark");
        }

        Ok(Self {
            conn,
            kind,
            last_seq,
        })
    }

    /// Returns the feed this tailer reads.
    #[must_use]
    pub const fn kind(&self) -> FeedKind {
        self.kind
    }

    /// Returns the sequence number of the last acknowledged entry.
    #[must_use]
    pub const fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Returns up to `limit` entries after the watermark, in order.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the feed cannot be read.
    pub fn poll(&self, limit: usize) -> Result<Vec<FeedEntry>, FeedError> {
        let conn = lock(&self.conn)?;
        poll_entries(&conn, self.kind, self.last_seq, limit)
    }

    /// Advances and persists the watermark to `seq`. Sequence numbers at or
    /// below the watermark are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the watermark cannot be written.
    pub fn acknowledge(&mut self, seq: u64) -> Result<(), FeedError> {
        if seq <= self.last_seq {
            return Ok(());
        }
        let conn = lock(&self.conn)?;
        persist_watermark(&conn, self.kind, seq)?;
        self.last_seq = seq;
        Ok(())
    }

    /// [`Self::poll`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the feed cannot be read.
    pub async fn poll_async(&self, limit: usize) -> Result<Vec<FeedEntry>, FeedError> {
        let conn = Arc::clone(&self.conn);
        let (kind, after) = (self.kind, self.last_seq);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            poll_entries(&conn, kind, after, limit)
        })
        .await
        .map_err(|e| FeedError::Database(format!("blocking task failed: {e}")))?
    }

    /// [`Self::acknowledge`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the watermark cannot be written.
    pub async fn acknowledge_async(&mut self, seq: u64) -> Result<(), FeedError> {
        if seq <= self.last_seq {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let kind = self.kind;
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            persist_watermark(&conn, kind, seq)
        })
        .await
        .map_err(|e| FeedError::Database(format!("blocking task failed: {e}")))??;
        self.last_seq = seq;
        Ok(())
    }

    /// Deletes acknowledged entries older than `ttl_secs`. Entries after the
    /// watermark are never deleted.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the entries cannot be deleted.
    pub fn evict_acknowledged(&self, ttl_secs: u64) -> Result<usize, FeedError> {
        let conn = lock(&self.conn)?;
        evict_entries(&conn, self.kind, self.last_seq, ttl_secs)
    }

    /// [`Self::evict_acknowledged`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Database`] if the entries cannot be deleted.
    pub async fn evict_acknowledged_async(&self, ttl_secs: u64) -> Result<usize, FeedError> {
        let conn = Arc::clone(&self.conn);
        let (kind, through) = (self.kind, self.last_seq);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            evict_entries(&conn, kind, through, ttl_secs)
        })
        .await
        .map_err(|e| FeedError::Database(format!("blocking task failed: {e}")))?
    }
}

impl std::fmt::Debug for FeedTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedTailer")
            .field("kind", &self.kind)
            .field("last_seq", &self.last_seq)
            .finish_non_exhaustive()
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, FeedError> {
    conn.lock()
        .map_err(|e| FeedError::Database(format!("mutex poisoned: {e}")))
}

#[allow(clippy::cast_sign_loss)]
fn load_watermark(conn: &Connection, kind: FeedKind) -> Result<u64, FeedError> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_seq FROM feed_watermarks WHERE feed_id = ?1",
            params![kind.feed_id()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| FeedError::Database(e.to_string()))?;
    Ok(last.unwrap_or(0) as u64)
}

#[allow(clippy::cast_possible_wrap)]
fn persist_watermark(conn: &Connection, kind: FeedKind, seq: u64) -> Result<(), FeedError> {
    conn.execute(
        "INSERT OR REPLACE INTO feed_watermarks (feed_id, last_seq, updated_at)
         VALUES (?1, ?2, ?3)",
        params![kind.feed_id(), seq as i64, now_secs()],
    )
    .map_err(|e| FeedError::Database(e.to_string()))?;
    Ok(())
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn poll_entries(
    conn: &Connection,
    kind: FeedKind,
    after: u64,
    limit: usize,
) -> Result<Vec<FeedEntry>, FeedError> {
    let mut stmt = conn
        .prepare_cached(kind.poll_sql())
        .map_err(|e| FeedError::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params![after as i64, limit as i64], |row| {
            Ok(FeedEntry {
                seq: row.get::<_, i64>(0)? as u64,
                kind,
                payload: row.get(1)?,
            })
        })
        .map_err(|e| FeedError::Database(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| FeedError::Database(e.to_string()))
}

#[allow(clippy::cast_possible_wrap)]
fn evict_entries(
    conn: &Connection,
    kind: FeedKind,
    through: u64,
    ttl_secs: u64,
) -> Result<usize, FeedError> {
    let cutoff = now_secs().saturating_sub(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
    let deleted = conn
        .execute(kind.evict_sql(), params![through as i64, cutoff])
        .map_err(|e| FeedError::Database(e.to_string()))?;
    if deleted > 0 {
        debug!(feed = %kind, deleted, through, "evicted acknowledged feed entries");
    }
    Ok(deleted)
}
