// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable storage for dispatch records, backed by SQLite.
//
// One row per occurrence key.  The composite primary key
// (observance_id, occurrence_time) is what makes "at most one record per
// occurrence" hold even across processes.  A small key/value table keeps
// the previous poll time so the evaluation window survives restarts.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument};

use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::{DispatchRecord, DispatchStatus, ObservanceId, OccurrenceKey};

/// SQLite schema for dispatch records and poll state.
const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS dispatch_records (
        observance_id TEXT NOT NULL,
        occurrence_time TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (observance_id, occurrence_time)
    );
    CREATE TABLE IF NOT EXISTS poll_state (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const LAST_POLL_TIME: &str = "last_poll_time";

/// Backing store for the occurrence tracker.
///
/// Only the tracker holds one of these; every other component goes through
/// the tracker's API.
pub trait DispatchStore: Send {
    /// Cheap liveness check, run at the start of every poll cycle.
    fn ping(&self) -> Result<()>;

    fn load_all(&self) -> Result<Vec<DispatchRecord>>;

    /// Write the record, replacing any existing row for the same key.
    fn upsert(&self, record: &DispatchRecord) -> Result<()>;

    /// Insert `record` unless a row for its key exists, then return the row
    /// as stored.  Never changes an existing row.
    fn insert_if_absent(&self, record: &DispatchRecord) -> Result<DispatchRecord>;

    /// Delete records last updated before `cutoff`.  Returns the row count.
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn last_poll_time(&self) -> Result<Option<DateTime<Utc>>>;

    fn set_last_poll_time(&self, at: DateTime<Utc>) -> Result<()>;

    /// Flush buffered writes to the main database file.
    fn checkpoint(&self) -> Result<()>;
}

/// Convert a `rusqlite::Error` into `ConnectorError::StoreUnavailable`.
fn store_err(context: &str) -> impl Fn(rusqlite::Error) -> ConnectorError + '_ {
    move |e| ConnectorError::StoreUnavailable(format!("{context}: {e}"))
}

const SELECT_RECORD_SQL: &str = "SELECT observance_id, occurrence_time, status, attempts,
        last_attempt_at, last_error, created_at, updated_at
    FROM dispatch_records";

/// Canonical timestamp text.  Keys compare as strings in SQL, so every
/// timestamp is written with the same precision and offset.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Dispatch store backed by a SQLite database.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    ///
    /// Uses WAL journal mode, which survives unclean shutdowns gracefully.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(store_err("open"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err("WAL pragma"))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(store_err("synchronous pragma"))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(store_err("create tables"))?;

        info!("dispatch store opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("open in-memory"))?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(store_err("create tables"))?;

        debug!("in-memory dispatch store opened");
        Ok(Self { conn })
    }
}

impl DispatchStore for SqliteStore {
    fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(store_err("ping"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn load_all(&self) -> Result<Vec<DispatchRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RECORD_SQL} ORDER BY occurrence_time ASC"))
            .map_err(store_err("prepare load_all"))?;

        let records = stmt
            .query_map([], row_to_record)
            .map_err(store_err("query load_all"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err("collect rows"))?;

        debug!(count = records.len(), "loaded dispatch records");
        Ok(records)
    }

    #[instrument(skip(self, record), fields(key = %record.key))]
    fn upsert(&self, record: &DispatchRecord) -> Result<()> {
        let status_json = serde_json::to_string(&record.status)?;

        self.conn
            .execute(
                "INSERT INTO dispatch_records (observance_id, occurrence_time, status,
                     attempts, last_attempt_at, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (observance_id, occurrence_time) DO UPDATE SET
                     status = excluded.status,
                     attempts = excluded.attempts,
                     last_attempt_at = excluded.last_attempt_at,
                     last_error = excluded.last_error,
                     updated_at = excluded.updated_at",
                params![
                    record.key.observance_id.as_str(),
                    ts(&record.key.occurrence_time),
                    status_json,
                    record.attempts,
                    record.last_attempt_at.as_ref().map(ts),
                    record.last_error,
                    ts(&record.created_at),
                    ts(&record.updated_at),
                ],
            )
            .map_err(store_err("upsert record"))?;

        debug!(status = ?record.status, attempts = record.attempts, "record written");
        Ok(())
    }

    #[instrument(skip(self, record), fields(key = %record.key))]
    fn insert_if_absent(&self, record: &DispatchRecord) -> Result<DispatchRecord> {
        let status_json = serde_json::to_string(&record.status)?;
        let observance_id = record.key.observance_id.as_str();
        let occurrence_time = ts(&record.key.occurrence_time);

        let inserted = self
            .conn
            .execute(
                "INSERT INTO dispatch_records (observance_id, occurrence_time, status,
                     attempts, last_attempt_at, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (observance_id, occurrence_time) DO NOTHING",
                params![
                    observance_id,
                    occurrence_time,
                    status_json,
                    record.attempts,
                    record.last_attempt_at.as_ref().map(ts),
                    record.last_error,
                    ts(&record.created_at),
                    ts(&record.updated_at),
                ],
            )
            .map_err(store_err("insert record"))?;

        let stored = self
            .conn
            .query_row(
                &format!("{SELECT_RECORD_SQL} WHERE observance_id = ?1 AND occurrence_time = ?2"),
                params![observance_id, occurrence_time],
                row_to_record,
            )
            .map_err(store_err("read back record"))?;

        debug!(inserted = inserted > 0, status = ?stored.status, "record ensured");
        Ok(stored)
    }

    #[instrument(skip(self))]
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let pending = serde_json::to_string(&DispatchStatus::Pending)?;
        let rows = self
            .conn
            .execute(
                "DELETE FROM dispatch_records WHERE updated_at < ?1 AND status != ?2",
                params![ts(&cutoff), pending],
            )
            .map_err(store_err("prune"))?;

        if rows > 0 {
            info!(rows, "pruned dispatch records past retention");
        }
        Ok(rows)
    }

    fn last_poll_time(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM poll_state WHERE name = ?1",
                params![LAST_POLL_TIME],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err("read poll state"))?;

        value
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ConnectorError::StoreUnavailable(format!("poll state: {e}")))
            })
            .transpose()
    }

    fn set_last_poll_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO poll_state (name, value) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET value = excluded.value",
                params![LAST_POLL_TIME, ts(&at)],
            )
            .map_err(store_err("write poll state"))?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(store_err("checkpoint"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Map a SQLite row to a `DispatchRecord`.
///
/// Column indices must match the column order in `SELECT_RECORD_SQL`.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DispatchRecord> {
    let observance_id: String = row.get(0)?;
    let occurrence_time: String = row.get(1)?;
    let status_json: String = row.get(2)?;
    let attempts: u32 = row.get(3)?;
    let last_attempt_at: Option<String> = row.get(4)?;
    let last_error: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    let status: DispatchStatus = serde_json::from_str(&status_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DispatchRecord {
        key: OccurrenceKey::new(ObservanceId(observance_id), parse_ts(1, &occurrence_time)?),
        status,
        attempts,
        last_attempt_at: last_attempt_at.map(|s| parse_ts(4, &s)).transpose()?,
        last_error,
        created_at: parse_ts(6, &created_at)?,
        updated_at: parse_ts(7, &updated_at)?,
    })
}
