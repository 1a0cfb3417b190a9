use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::record::{
    NewRecord, RecordError, RecordKey, RecordStatus, SyncRecord, SyncStats, Transition,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_records (
    entity_type   TEXT NOT NULL,
    id            TEXT NOT NULL,
    payload       BLOB NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    encrypted     INTEGER NOT NULL DEFAULT 0,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL DEFAULT 3,
    last_error    TEXT,
    origin        TEXT,
    revision      INTEGER NOT NULL DEFAULT 1,
    seq           INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (entity_type, id)
);

CREATE INDEX IF NOT EXISTS idx_sync_records_status ON sync_records(status, seq);
CREATE INDEX IF NOT EXISTS idx_sync_records_entity ON sync_records(entity_type, status);
"#;

const COLUMNS: &str = "entity_type, id, payload, status, created_at, updated_at, retry_count, \
                       max_retries, encrypted, last_error, origin, revision, seq";

/// SQLite-backed store of offline write records.
///
/// Every status change is a single guarded `UPDATE`: it only applies while the
/// record is still `pending` at the revision the caller read, so a drain pass
/// and a concurrent re-enqueue can never interleave a partial update.
pub struct QueueStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create queue directory {}", parent.display())
            })?;
            #[cfg(unix)]
            set_owner_perms(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open queue database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for offline queue")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        Self::init(path.to_path_buf(), conn)
    }

    /// Non-durable store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory queue")?;
        Self::init(PathBuf::from(":memory:"), conn)
    }

    fn init(path: PathBuf, conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize queue schema")?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("offline queue connection lock poisoned"))
    }

    /// Insert a pending record, replacing any previous record for the same key.
    ///
    /// A replaced record keeps its `created_at`, restarts its retry budget,
    /// gets a new revision and moves to the tail of the drain order.
    pub fn put(&self, record: &NewRecord) -> Result<SyncRecord> {
        let key = record.key();
        let conn = self.conn()?;
        upsert(&conn, record, "")?;
        fetch(&conn, &key)?.ok_or_else(|| anyhow!("record {key} missing after write"))
    }

    /// Like [`put`](Self::put), but never replaces a pending application
    /// write (`origin` unset). Returns `None` when such a record holds the key.
    pub fn put_unless_local_pending(&self, record: &NewRecord) -> Result<Option<SyncRecord>> {
        let key = record.key();
        let conn = self.conn()?;
        let written = upsert(
            &conn,
            record,
            "WHERE NOT (sync_records.status = 'pending' AND sync_records.origin IS NULL)",
        )?;
        if written == 0 {
            return Ok(None);
        }
        fetch(&conn, &key)
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<SyncRecord>> {
        let conn = self.conn()?;
        fetch(&conn, key)
    }

    /// Pending records in drain order, optionally for one entity type.
    pub fn list_pending(
        &self,
        entity_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<SyncRecord>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_records
             WHERE status = 'pending' AND (?1 IS NULL OR entity_type = ?1)
             ORDER BY seq ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![entity_type, limit], record_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list pending records")
    }

    /// All records, most recently created first.
    pub fn history(&self, limit: usize) -> Result<Vec<SyncRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_records
             ORDER BY created_at DESC, seq DESC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], record_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read record history")
    }

    pub fn mark_synced(&self, key: &RecordKey, revision: i64) -> Result<Transition> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "UPDATE sync_records
                 SET status = 'synced', last_error = NULL, updated_at = ?4
                 WHERE entity_type = ?1 AND id = ?2 AND revision = ?3 AND status = 'pending'
                 RETURNING status, retry_count",
                params![key.entity_type, key.id, revision, Utc::now().timestamp_millis()],
                transition_from_row,
            )
            .optional()
            .with_context(|| format!("failed to mark {key} synced"))?;
        Ok(row.unwrap_or(Transition::Stale))
    }

    pub fn mark_failed(&self, key: &RecordKey, revision: i64, reason: &str) -> Result<Transition> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "UPDATE sync_records
                 SET status = 'failed', last_error = ?4, updated_at = ?5
                 WHERE entity_type = ?1 AND id = ?2 AND revision = ?3 AND status = 'pending'
                 RETURNING status, retry_count",
                params![key.entity_type, key.id, revision, reason, Utc::now().timestamp_millis()],
                transition_from_row,
            )
            .optional()
            .with_context(|| format!("failed to mark {key} failed"))?;
        Ok(row.unwrap_or(Transition::Stale))
    }

    /// Count a failed attempt. The record becomes `failed` in the same
    /// statement once `retry_count` reaches `max_retries`.
    pub fn increment_retry(
        &self,
        key: &RecordKey,
        revision: i64,
        reason: &str,
    ) -> Result<Transition> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "UPDATE sync_records
                 SET retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                     last_error = ?4,
                     updated_at = ?5
                 WHERE entity_type = ?1 AND id = ?2 AND revision = ?3 AND status = 'pending'
                 RETURNING status, retry_count",
                params![key.entity_type, key.id, revision, reason, Utc::now().timestamp_millis()],
                transition_from_row,
            )
            .optional()
            .with_context(|| format!("failed to record retry for {key}"))?;
        Ok(row.unwrap_or(Transition::Stale))
    }

    /// Manual retry of a failed record: back to `pending` with a fresh budget.
    pub fn reset_for_retry(&self, key: &RecordKey) -> Result<Option<SyncRecord>> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE sync_records
                 SET status = 'pending',
                     retry_count = 0,
                     last_error = NULL,
                     revision = revision + 1,
                     seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_records),
                     updated_at = ?3
                 WHERE entity_type = ?1 AND id = ?2 AND status = 'failed'",
                params![key.entity_type, key.id, Utc::now().timestamp_millis()],
            )
            .with_context(|| format!("failed to reset {key} for retry"))?;
        if updated == 0 {
            return Ok(None);
        }
        fetch(&conn, key)
    }

    /// Delete `synced` records last touched at or before `cutoff`.
    pub fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM sync_records WHERE status = 'synced' AND updated_at <= ?1",
                [cutoff.timestamp_millis()],
            )
            .context("failed to purge synced records")?;
        Ok(deleted as u64)
    }

    pub fn stats(&self, entity_type: Option<&str>) -> Result<SyncStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM sync_records
             WHERE (?1 IS NULL OR entity_type = ?1)
             GROUP BY status",
        )?;
        let mut rows = stmt.query([entity_type])?;
        let mut stats = SyncStats::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            stats.add(status.parse()?, count as u64);
        }
        Ok(stats)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn upsert(conn: &Connection, record: &NewRecord, guard: &str) -> Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO sync_records(entity_type, id, payload, status, encrypted, retry_count,
                                      max_retries, last_error, origin, revision, seq,
                                      created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, NULL, ?6, 1,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_records), ?7, ?7)
             ON CONFLICT(entity_type, id) DO UPDATE SET
                payload = excluded.payload,
                status = 'pending',
                encrypted = excluded.encrypted,
                retry_count = 0,
                max_retries = excluded.max_retries,
                last_error = NULL,
                origin = excluded.origin,
                revision = sync_records.revision + 1,
                seq = excluded.seq,
                updated_at = excluded.updated_at
             {guard}"
        ),
        params![
            record.entity_type,
            record.id,
            record.payload,
            record.encrypted,
            record.max_retries,
            record.origin.map(|side| side.as_str()),
            Utc::now().timestamp_millis(),
        ],
    )
    .with_context(|| format!("failed to persist record {}", record.key()))
}

fn fetch(conn: &Connection, key: &RecordKey) -> Result<Option<SyncRecord>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM sync_records WHERE entity_type = ?1 AND id = ?2"),
        params![key.entity_type, key.id],
        record_from_row,
    )
    .optional()
    .with_context(|| format!("failed to read record {key}"))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    let status: String = row.get(3)?;
    let origin: Option<String> = row.get(10)?;
    Ok(SyncRecord {
        entity_type: row.get(0)?,
        id: row.get(1)?,
        payload: row.get(2)?,
        status: status.parse().map_err(|e| conversion_error(3, e))?,
        created_at: millis_to_datetime(row.get(4)?).map_err(|e| conversion_error(4, e))?,
        updated_at: millis_to_datetime(row.get(5)?).map_err(|e| conversion_error(5, e))?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        encrypted: row.get(8)?,
        last_error: row.get(9)?,
        origin: origin
            .map(|side| side.parse())
            .transpose()
            .map_err(|e| conversion_error(10, e))?,
        revision: row.get(11)?,
        seq: row.get(12)?,
    })
}

fn transition_from_row(row: &Row<'_>) -> rusqlite::Result<Transition> {
    let status: String = row.get(0)?;
    Ok(Transition::Applied {
        status: status.parse().map_err(|e| conversion_error(0, e))?,
        retry_count: row.get(1)?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, RecordError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(RecordError::InvalidTimestamp(millis))
}

fn conversion_error(idx: usize, err: RecordError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_perms(_path: &Path) -> Result<()> {
    Ok(())
}
