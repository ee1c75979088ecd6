//! SQLite database implementing the ingest persistence contract
//!
//! One connection behind a mutex. Every compare-and-set transition is a
//! conditional `UPDATE ... WHERE status = ?` whose affected-row count decides
//! the outcome, so concurrent schedulers never double-assign.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::DbEnum;

/// SQLite-backed store for batches, queue, workers, uploads and dedup output
#[derive(Clone)]
pub struct IngestDb {
    pub(super) conn: Arc<Mutex<Connection>>,
}

impl IngestDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        tracing::info!("Opened ingest database at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Internal(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }
}

const SCHEMA: &str = r#"
    -- Per-tenant overrides of batch defaults
    CREATE TABLE IF NOT EXISTS tenant_settings (
        tenant_id TEXT PRIMARY KEY,
        max_files_per_batch INTEGER,
        max_batch_bytes INTEGER,
        max_file_size INTEGER,
        max_active_batches INTEGER,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tenant_allowed_extensions (
        tenant_id TEXT NOT NULL REFERENCES tenant_settings(tenant_id) ON DELETE CASCADE,
        extension TEXT NOT NULL,
        PRIMARY KEY (tenant_id, extension)
    );

    -- Batches
    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        batch_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        total_files INTEGER NOT NULL DEFAULT 0,
        uploaded_files INTEGER NOT NULL DEFAULT 0,
        processed_files INTEGER NOT NULL DEFAULT 0,
        failed_files INTEGER NOT NULL DEFAULT 0,
        skipped_files INTEGER NOT NULL DEFAULT 0,
        total_bytes INTEGER NOT NULL DEFAULT 0,
        uploaded_bytes INTEGER NOT NULL DEFAULT 0,
        processed_bytes INTEGER NOT NULL DEFAULT 0,
        progress REAL NOT NULL DEFAULT 0,
        max_files INTEGER NOT NULL,
        max_total_bytes INTEGER NOT NULL,
        max_file_size INTEGER NOT NULL,
        duplicate_policy TEXT NOT NULL,
        concurrency_mode TEXT NOT NULL,
        priority INTEGER NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        deleted_at TEXT,
        UNIQUE (tenant_id, batch_number)
    );

    CREATE INDEX IF NOT EXISTS idx_batches_tenant_status ON batches(tenant_id, status);

    CREATE TABLE IF NOT EXISTS batch_allowed_extensions (
        batch_id TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
        extension TEXT NOT NULL,
        PRIMARY KEY (batch_id, extension)
    );

    -- Files within a batch
    CREATE TABLE IF NOT EXISTS batch_files (
        id TEXT PRIMARY KEY,
        batch_id TEXT NOT NULL REFERENCES batches(id),
        tenant_id TEXT NOT NULL,
        original_filename TEXT NOT NULL,
        sanitized_filename TEXT NOT NULL,
        extension TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        content_hash TEXT,
        declared_hash TEXT,
        is_duplicate INTEGER NOT NULL DEFAULT 0,
        duplicate_of TEXT,
        processing_order INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        upload_status TEXT NOT NULL,
        processing_status TEXT NOT NULL,
        validation_status TEXT NOT NULL,
        scan_status TEXT NOT NULL,
        uploaded_bytes INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        needs_review INTEGER NOT NULL DEFAULT 0,
        storage_path TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        processed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_batch_files_batch ON batch_files(batch_id, processing_order);
    CREATE INDEX IF NOT EXISTS idx_batch_files_tenant_hash ON batch_files(tenant_id, content_hash);

    CREATE TABLE IF NOT EXISTS batch_file_metadata (
        file_id TEXT NOT NULL REFERENCES batch_files(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (file_id, key)
    );

    -- Queue
    CREATE TABLE IF NOT EXISTS queue_items (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        queue_type TEXT NOT NULL,
        priority INTEGER NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        worker_type TEXT NOT NULL,
        assigned_worker TEXT,
        memory_mb INTEGER NOT NULL,
        cpu_cores INTEGER NOT NULL,
        disk_mb INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        next_retry_at TEXT,
        scheduled_at TEXT NOT NULL,
        expires_at TEXT,
        max_processing_secs INTEGER NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status, priority, position);
    CREATE INDEX IF NOT EXISTS idx_queue_items_batch ON queue_items(batch_id);

    CREATE TABLE IF NOT EXISTS queue_item_dependencies (
        item_id TEXT NOT NULL REFERENCES queue_items(id) ON DELETE CASCADE,
        batch_id TEXT NOT NULL,
        PRIMARY KEY (item_id, batch_id)
    );

    CREATE TABLE IF NOT EXISTS queue_item_file_types (
        item_id TEXT NOT NULL REFERENCES queue_items(id) ON DELETE CASCADE,
        file_type TEXT NOT NULL,
        PRIMARY KEY (item_id, file_type)
    );

    -- Worker registry
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        worker_type TEXT NOT NULL,
        status TEXT NOT NULL,
        health TEXT NOT NULL,
        max_concurrent_batches INTEGER NOT NULL,
        max_concurrent_files INTEGER NOT NULL,
        memory_mb INTEGER NOT NULL,
        cpu_cores INTEGER NOT NULL,
        load_batches INTEGER NOT NULL DEFAULT 0,
        load_memory_mb INTEGER NOT NULL DEFAULT 0,
        load_cpu_cores INTEGER NOT NULL DEFAULT 0,
        last_heartbeat TEXT NOT NULL,
        registered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS worker_file_types (
        worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
        file_type TEXT NOT NULL,
        PRIMARY KEY (worker_id, file_type)
    );

    -- Chunked uploads
    CREATE TABLE IF NOT EXISTS upload_sessions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        batch_file_id TEXT,
        filename TEXT NOT NULL,
        total_size INTEGER NOT NULL,
        chunk_size INTEGER NOT NULL,
        total_chunks INTEGER NOT NULL,
        uploaded_chunks INTEGER NOT NULL DEFAULT 0,
        uploaded_bytes INTEGER NOT NULL DEFAULT 0,
        expected_hash TEXT,
        final_hash TEXT,
        status TEXT NOT NULL,
        staging_dir TEXT NOT NULL,
        final_path TEXT,
        error TEXT,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_upload_sessions_status ON upload_sessions(status, expires_at);
    CREATE INDEX IF NOT EXISTS idx_upload_sessions_file ON upload_sessions(batch_file_id);

    CREATE TABLE IF NOT EXISTS upload_chunks (
        session_id TEXT NOT NULL REFERENCES upload_sessions(id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        expected_size INTEGER NOT NULL,
        actual_size INTEGER,
        expected_hash TEXT,
        actual_hash TEXT,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        uploaded_at TEXT,
        PRIMARY KEY (session_id, chunk_index)
    );

    -- Duplicate detection
    CREATE TABLE IF NOT EXISTS detection_sessions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        scope_batch_id TEXT,
        status TEXT NOT NULL,
        files_considered INTEGER NOT NULL DEFAULT 0,
        pairs_compared INTEGER NOT NULL DEFAULT 0,
        matches_found INTEGER NOT NULL DEFAULT 0,
        groups_created INTEGER NOT NULL DEFAULT 0,
        errors INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS detection_session_algorithms (
        session_id TEXT NOT NULL REFERENCES detection_sessions(id) ON DELETE CASCADE,
        algorithm TEXT NOT NULL,
        PRIMARY KEY (session_id, algorithm)
    );

    CREATE TABLE IF NOT EXISTS duplicate_groups (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        master_file_id TEXT NOT NULL,
        total_size INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        auto_resolvable INTEGER NOT NULL,
        quality_score REAL NOT NULL,
        confidence_score REAL NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_duplicate_groups_tenant ON duplicate_groups(tenant_id, resolved);

    CREATE TABLE IF NOT EXISTS duplicate_group_members (
        group_id TEXT NOT NULL REFERENCES duplicate_groups(id) ON DELETE CASCADE,
        file_id TEXT NOT NULL,
        is_master INTEGER NOT NULL,
        quality_score REAL NOT NULL,
        size_bytes INTEGER NOT NULL,
        PRIMARY KEY (group_id, file_id)
    );

    CREATE TABLE IF NOT EXISTS duplicate_records (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        file_a TEXT NOT NULL,
        file_b TEXT NOT NULL,
        algorithm TEXT NOT NULL,
        similarity REAL NOT NULL,
        confidence TEXT NOT NULL,
        recommended_action TEXT NOT NULL,
        auto_resolvable INTEGER NOT NULL,
        metrics TEXT NOT NULL,
        status TEXT NOT NULL,
        group_id TEXT,
        resolution TEXT,
        resolved_by TEXT,
        resolved_at TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (tenant_id, file_a, file_b)
    );

    CREATE INDEX IF NOT EXISTS idx_duplicate_records_group ON duplicate_records(group_id);
    CREATE INDEX IF NOT EXISTS idx_duplicate_records_session ON duplicate_records(session_id);

    -- Rate limiting
    CREATE TABLE IF NOT EXISTS rate_limit_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scope_key TEXT NOT NULL,
        operation TEXT NOT NULL,
        occurred_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_rate_limit_usage ON rate_limit_usage(scope_key, operation, occurred_at);

    CREATE TABLE IF NOT EXISTS rate_limit_overrides (
        tenant_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        window_secs INTEGER NOT NULL,
        max_requests INTEGER NOT NULL,
        burst_limit INTEGER,
        PRIMARY KEY (tenant_id, operation)
    );

    -- Append-only structured event log
    CREATE TABLE IF NOT EXISTS event_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT,
        event_type TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_event_log_tenant ON event_log(tenant_id, created_at);
"#;

// ==================== Column helpers ====================

/// Fixed-width RFC 3339 so lexical order matches time order
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

fn conversion_error(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("invalid value '{}' in column {}", value, column).into(),
    )
}

fn parse_ts(column: &str, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| conversion_error(column, raw))
}

pub(crate) fn get_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_ts(column, &raw)
}

pub(crate) fn get_opt_ts(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|r| parse_ts(column, &r)).transpose()
}

pub(crate) fn get_uuid(row: &Row, column: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(column)?;
    Uuid::parse_str(&raw).map_err(|_| conversion_error(column, &raw))
}

pub(crate) fn get_opt_uuid(row: &Row, column: &str) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|r| Uuid::parse_str(&r).map_err(|_| conversion_error(column, &r)))
        .transpose()
}

pub(crate) fn get_enum<T: DbEnum>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    T::from_db(&raw).ok_or_else(|| conversion_error(column, &raw))
}

pub(crate) fn get_opt_enum<T: DbEnum>(row: &Row, column: &str) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|r| T::from_db(&r).ok_or_else(|| conversion_error(column, &r)))
        .transpose()
}

pub(crate) fn get_u32(row: &Row, column: &str) -> rusqlite::Result<u32> {
    let v: i64 = row.get(column)?;
    Ok(v.max(0) as u32)
}

pub(crate) fn get_u64(row: &Row, column: &str) -> rusqlite::Result<u64> {
    let v: i64 = row.get(column)?;
    Ok(v.max(0) as u64)
}

pub(crate) fn get_bool(row: &Row, column: &str) -> rusqlite::Result<bool> {
    let v: i64 = row.get(column)?;
    Ok(v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = IngestDb::in_memory().unwrap();
        db.migrate().unwrap();
        let conn = db.conn.lock();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'batches'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(ts(earlier) < ts(later));
        assert_eq!(ts(earlier).len(), ts(later).len());
    }

    #[test]
    fn test_file_database_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ingest.db");
        let _db = IngestDb::new(&path).unwrap();
        assert!(path.exists());
    }
}
