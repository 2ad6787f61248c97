//! SQLite storage primitives shared by the snapshot log and the task tracker.
//!
//! One `SqliteStore` wraps one connection. Concurrent callers each open their
//! own store on the same file; WAL mode plus `busy_timeout` serializes
//! writers, and every guarded mutation is a single conditional statement.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use waybill_core::{clock, Error, Page, Result};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    seq INTEGER PRIMARY KEY,
    id TEXT UNIQUE NOT NULL,
    delivery_id TEXT NOT NULL,
    snapshot_type TEXT NOT NULL,
    snapshot_data TEXT NOT NULL,
    previous_snapshot_id TEXT,
    triggered_by TEXT NOT NULL,
    triggered_by_user_id TEXT,
    triggered_event TEXT NOT NULL,
    delivery_status TEXT,
    customer_id TEXT,
    order_id TEXT,
    vehicle_id TEXT,
    driver_name TEXT,
    delivery_address_province TEXT,
    delivery_fee TEXT,
    provider_code TEXT,
    created_at TEXT NOT NULL,
    business_date TEXT NOT NULL,
    hash TEXT NOT NULL,
    archived_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_snapshots_delivery_ts ON snapshots(delivery_id, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_snapshots_business_date ON snapshots(business_date);
CREATE INDEX IF NOT EXISTS idx_snapshots_provider_ts ON snapshots(provider_code, created_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_type_ts ON snapshots(snapshot_type, created_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON snapshots(created_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_customer ON snapshots(customer_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_order ON snapshots(order_id);

-- Audit columns are write-once; only archived_at may change.
CREATE TRIGGER IF NOT EXISTS snapshots_append_only
BEFORE UPDATE OF id, delivery_id, snapshot_type, snapshot_data, previous_snapshot_id,
    triggered_by, triggered_by_user_id, triggered_event, delivery_status, customer_id,
    order_id, vehicle_id, driver_name, delivery_address_province, delivery_fee,
    provider_code, created_at, business_date, hash
ON snapshots
BEGIN
    SELECT RAISE(ABORT, 'snapshots are append-only');
END;

CREATE TABLE IF NOT EXISTS coordination_tasks (
    id TEXT PRIMARY KEY,
    delivery_id TEXT NOT NULL,
    provider_code TEXT NOT NULL,
    task_type TEXT NOT NULL,
    task_status TEXT NOT NULL,
    assigned_to_user_id TEXT,
    task_instructions TEXT NOT NULL DEFAULT '',
    contact_information TEXT NOT NULL DEFAULT '{}',
    completed_at TEXT,
    completion_notes TEXT,
    external_reference TEXT,
    reminder_count INTEGER NOT NULL DEFAULT 0,
    last_reminder_sent TEXT,
    next_reminder_due TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (task_status IN ('pending', 'in_progress', 'completed', 'failed', 'cancelled')),
    CHECK (task_status IN ('pending', 'in_progress') OR next_reminder_due IS NULL)
);

CREATE INDEX IF NOT EXISTS idx_tasks_delivery ON coordination_tasks(delivery_id);
CREATE INDEX IF NOT EXISTS idx_tasks_provider ON coordination_tasks(provider_code);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON coordination_tasks(task_status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON coordination_tasks(assigned_to_user_id);
CREATE INDEX IF NOT EXISTS idx_tasks_reminder_due ON coordination_tasks(next_reminder_due)
    WHERE next_reminder_due IS NOT NULL;

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// SQLite-backed storage engine.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open an existing database. Fails if the file does not exist.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(Error::store)?;
        let store = Self { conn };
        store.apply_pragmas(busy_timeout)?;
        Ok(store)
    }

    /// Open or create a database with the full schema.
    pub fn open_or_create(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::store)?;
        }
        let conn = Connection::open(db_path).map_err(Error::store)?;
        let store = Self { conn };
        store.apply_pragmas(busy_timeout)?;
        store.apply_schema()?;
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::store)?;
        let store = Self { conn };
        store.apply_pragmas(DEFAULT_BUSY_TIMEOUT)?;
        store.apply_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn apply_pragmas(&self, busy_timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(busy_timeout).map_err(Error::store)?;
        self.conn
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA synchronous = NORMAL;",
            )
            .map_err(Error::store)?;
        Ok(())
    }

    fn apply_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL).map_err(Error::store)?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )
            .map_err(Error::store)?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32> {
        let version: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::store)?;
        match version {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Invalid(format!("corrupt schema version: {v:?}"))),
            None => Ok(0),
        }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        // Passive checkpoint never waits on other connections.
        let _ = self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);");
    }
}

// ── Parameter helpers ──

pub(crate) fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

pub(crate) fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

pub(crate) fn ts(ts: OffsetDateTime) -> Value {
    Value::Text(clock::format_timestamp(ts))
}

pub(crate) fn opt_ts(value: Option<OffsetDateTime>) -> Value {
    match value {
        Some(v) => ts(v),
        None => Value::Null,
    }
}

/// `?, ?, ?` for an `IN (...)` list of `n` items.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `LIMIT ? OFFSET ?` values. SQLite treats a negative limit as unbounded.
pub(crate) fn page_values(page: Page) -> [Value; 2] {
    let limit = if page.limit == 0 { -1 } else { i64::from(page.limit) };
    [Value::Integer(limit), Value::Integer(i64::from(page.offset))]
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<OffsetDateTime>> {
    raw.as_deref().map(clock::parse_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tables: Vec<String> = store
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(tables.contains(&"snapshots".to_string()));
        assert!(tables.contains(&"coordination_tasks".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStore::open(&dir.path().join("absent.db"), DEFAULT_BUSY_TIMEOUT);
        assert!(matches!(err, Err(Error::Store(_))));
    }

    #[test]
    fn idempotent_schema_apply() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("ledger.db");
        drop(SqliteStore::open_or_create(&db, DEFAULT_BUSY_TIMEOUT).unwrap());
        let again = SqliteStore::open_or_create(&db, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert_eq!(again.schema_version().unwrap(), SCHEMA_VERSION);
        drop(again);
        let plain = SqliteStore::open(&db, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert_eq!(plain.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn terminal_task_cannot_hold_reminder() {
        let store = SqliteStore::open_in_memory().unwrap();
        let res = store.conn.execute(
            "INSERT INTO coordination_tasks
             (id, delivery_id, provider_code, task_type, task_status, next_reminder_due,
              created_at, updated_at)
             VALUES ('t', 'D', 'p', 'pickup_call', 'completed', '2026-01-01T00:00:00.000000Z',
                     '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
            [],
        );
        assert!(res.is_err());
    }

    #[test]
    fn page_values_unbounded() {
        assert_eq!(
            page_values(Page::ALL),
            [Value::Integer(-1), Value::Integer(0)]
        );
        assert_eq!(
            page_values(Page::new(10, 20)),
            [Value::Integer(10), Value::Integer(20)]
        );
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
