//! Batch, batch file and tenant settings persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::database::{
    get_bool, get_enum, get_opt_ts, get_opt_uuid, get_ts, get_u32, get_u64,
    get_uuid, opt_ts, ts, IngestDb,
};
use crate::error::{Error, Result};
use crate::types::{
    Batch, BatchFile, BatchLimits, BatchStatus, DbEnum, ProcessingStatus, TenantSettings,
};

/// Per-file counters summed over one batch
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileAggregates {
    pub total_files: u32,
    pub uploaded_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    pub skipped_files: u32,
    /// Queued or processing right now
    pub in_progress_files: u32,
    pub needs_review: u32,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub processed_bytes: u64,
}

impl FileAggregates {
    pub fn finished_files(&self) -> u32 {
        self.completed_files + self.failed_files + self.skipped_files
    }
}

const ACTIVE_BATCH_STATUSES: &str = "'pending', 'validating', 'uploading', 'processing'";

impl IngestDb {
    // ==================== Tenant settings ====================

    /// Get the override row for a tenant
    pub fn get_tenant_settings(&self, tenant_id: Uuid) -> Result<Option<TenantSettings>> {
        let conn = self.conn.lock();

        let settings = conn
            .query_row(
                "SELECT * FROM tenant_settings WHERE tenant_id = ?1",
                params![tenant_id.to_string()],
                |row| {
                    Ok(TenantSettings {
                        tenant_id: get_uuid(row, "tenant_id")?,
                        max_files_per_batch: row
                            .get::<_, Option<i64>>("max_files_per_batch")?
                            .map(|v| v as u32),
                        max_batch_bytes: row
                            .get::<_, Option<i64>>("max_batch_bytes")?
                            .map(|v| v as u64),
                        max_file_size: row
                            .get::<_, Option<i64>>("max_file_size")?
                            .map(|v| v as u64),
                        allowed_extensions: None,
                        max_active_batches: row
                            .get::<_, Option<i64>>("max_active_batches")?
                            .map(|v| v as u32),
                    })
                },
            )
            .optional()?;

        let Some(mut settings) = settings else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT extension FROM tenant_allowed_extensions WHERE tenant_id = ?1 ORDER BY extension",
        )?;
        let extensions: Vec<String> = stmt
            .query_map(params![tenant_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        if !extensions.is_empty() {
            settings.allowed_extensions = Some(extensions);
        }

        Ok(Some(settings))
    }

    /// Create or replace a tenant's overrides
    pub fn put_tenant_settings(&self, settings: &TenantSettings) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let tenant = settings.tenant_id.to_string();

        tx.execute(
            r#"
            INSERT INTO tenant_settings (
                tenant_id, max_files_per_batch, max_batch_bytes, max_file_size,
                max_active_batches, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(tenant_id) DO UPDATE SET
                max_files_per_batch = excluded.max_files_per_batch,
                max_batch_bytes = excluded.max_batch_bytes,
                max_file_size = excluded.max_file_size,
                max_active_batches = excluded.max_active_batches,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant,
                settings.max_files_per_batch.map(|v| v as i64),
                settings.max_batch_bytes.map(|v| v as i64),
                settings.max_file_size.map(|v| v as i64),
                settings.max_active_batches.map(|v| v as i64),
                ts(Utc::now()),
            ],
        )?;

        tx.execute(
            "DELETE FROM tenant_allowed_extensions WHERE tenant_id = ?1",
            params![tenant],
        )?;
        for ext in settings.allowed_extensions.iter().flatten() {
            tx.execute(
                "INSERT OR IGNORE INTO tenant_allowed_extensions (tenant_id, extension) VALUES (?1, ?2)",
                params![tenant, ext.to_lowercase()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ==================== Batches ====================

    /// Non-terminal, non-deleted batches of a tenant
    pub fn count_active_batches(&self, tenant_id: Uuid) -> Result<u32> {
        let conn = self.conn.lock();
        active_batch_count(&conn, tenant_id)
    }

    /// Insert a batch, assigning the next per-tenant batch number
    pub fn insert_batch(&self, batch: &mut Batch) -> Result<()> {
        self.insert_batch_below(batch, u32::MAX).map(|_| ())
    }

    /// Insert a batch only while the tenant has fewer than `max_active`
    /// active batches.
    ///
    /// Returns the active count seen inside the transaction; nothing is
    /// written when it is already at `max_active`.
    pub fn insert_batch_below(&self, batch: &mut Batch, max_active: u32) -> Result<u32> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active = active_batch_count(&tx, batch.tenant_id)?;
        if active >= max_active {
            return Ok(active);
        }

        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(batch_number), 0) + 1 FROM batches WHERE tenant_id = ?1",
            params![batch.tenant_id.to_string()],
            |row| row.get(0),
        )?;
        batch.batch_number = next;

        tx.execute(
            r#"
            INSERT INTO batches (
                id, tenant_id, name, batch_number, status, total_files, uploaded_files,
                processed_files, failed_files, skipped_files, total_bytes, uploaded_bytes,
                processed_bytes, progress, max_files, max_total_bytes, max_file_size,
                duplicate_policy, concurrency_mode, priority, error, created_at, updated_at,
                started_at, completed_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
            "#,
            params![
                batch.id.to_string(),
                batch.tenant_id.to_string(),
                batch.name,
                batch.batch_number,
                batch.status.as_str(),
                batch.total_files as i64,
                batch.uploaded_files as i64,
                batch.processed_files as i64,
                batch.failed_files as i64,
                batch.skipped_files as i64,
                batch.total_bytes as i64,
                batch.uploaded_bytes as i64,
                batch.processed_bytes as i64,
                batch.progress,
                batch.limits.max_files as i64,
                batch.limits.max_total_bytes as i64,
                batch.limits.max_file_size as i64,
                batch.duplicate_policy.as_str(),
                batch.concurrency_mode.as_str(),
                batch.priority as i64,
                batch.error,
                ts(batch.created_at),
                ts(batch.updated_at),
                opt_ts(batch.started_at),
                opt_ts(batch.completed_at),
                opt_ts(batch.deleted_at),
            ],
        )?;

        for ext in &batch.limits.allowed_extensions {
            tx.execute(
                "INSERT OR IGNORE INTO batch_allowed_extensions (batch_id, extension) VALUES (?1, ?2)",
                params![batch.id.to_string(), ext],
            )?;
        }

        tx.commit()?;
        Ok(active)
    }

    /// Get a batch by ID, including soft-deleted ones
    pub fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let conn = self.conn.lock();
        load_batch(&conn, batch_id)
    }

    /// List a tenant's batches, newest first
    pub fn list_batches(&self, tenant_id: Uuid) -> Result<Vec<Batch>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT * FROM batches WHERE tenant_id = ?1 AND deleted_at IS NULL ORDER BY batch_number DESC",
        )?;
        let mut batches: Vec<Batch> = stmt
            .query_map(params![tenant_id.to_string()], row_to_batch)?
            .collect::<rusqlite::Result<_>>()?;

        for batch in &mut batches {
            batch.limits.allowed_extensions = load_batch_extensions(&conn, batch.id)?;
        }
        Ok(batches)
    }

    /// Compare-and-set status transition
    pub fn transition_batch(
        &self,
        batch_id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();

        let allowed: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            r#"
            UPDATE batches SET
                status = ?2,
                error = COALESCE(?3, error),
                updated_at = ?4,
                started_at = CASE WHEN ?2 = 'uploading' THEN COALESCE(started_at, ?4) ELSE started_at END,
                completed_at = CASE WHEN ?5 THEN COALESCE(completed_at, ?4) ELSE completed_at END
            WHERE id = ?1 AND deleted_at IS NULL AND status IN ({})
            "#,
            allowed.join(", ")
        );

        let count = conn.execute(
            &sql,
            params![
                batch_id.to_string(),
                to.as_str(),
                error,
                ts(now),
                to.is_terminal(),
            ],
        )?;
        Ok(count == 1)
    }

    /// Store recomputed counters, progress and status
    pub fn write_batch_aggregates(
        &self,
        batch_id: Uuid,
        agg: &FileAggregates,
        status: BatchStatus,
        progress: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            UPDATE batches SET
                total_files = ?2,
                uploaded_files = ?3,
                processed_files = ?4,
                failed_files = ?5,
                skipped_files = ?6,
                total_bytes = ?7,
                uploaded_bytes = ?8,
                processed_bytes = ?9,
                progress = ?10,
                status = ?11,
                updated_at = ?12,
                completed_at = CASE WHEN ?13 THEN COALESCE(completed_at, ?12) ELSE completed_at END
            WHERE id = ?1
            "#,
            params![
                batch_id.to_string(),
                agg.total_files as i64,
                agg.uploaded_files as i64,
                agg.completed_files as i64,
                agg.failed_files as i64,
                agg.skipped_files as i64,
                agg.total_bytes as i64,
                agg.uploaded_bytes as i64,
                agg.processed_bytes as i64,
                progress,
                status.as_str(),
                ts(now),
                status.is_terminal(),
            ],
        )
        .map_err(|e| Error::Internal(format!("Failed to write batch aggregates: {}", e)))?;

        Ok(())
    }

    /// Soft delete; files keep referencing the row
    pub fn soft_delete_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE batches SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![batch_id.to_string(), ts(now)],
        )?;
        Ok(count == 1)
    }

    // ==================== Batch files ====================

    /// Insert files in one transaction
    pub fn insert_batch_files(&self, files: &[BatchFile]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for file in files {
            tx.execute(
                r#"
                INSERT INTO batch_files (
                    id, batch_id, tenant_id, original_filename, sanitized_filename, extension,
                    size_bytes, content_type, content_hash, declared_hash, is_duplicate,
                    duplicate_of, processing_order, priority, upload_status, processing_status,
                    validation_status, scan_status, uploaded_bytes, error_count, last_error,
                    needs_review, storage_path, created_at, updated_at, processed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                          ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
                "#,
                params![
                    file.id.to_string(),
                    file.batch_id.to_string(),
                    file.tenant_id.to_string(),
                    file.original_filename,
                    file.sanitized_filename,
                    file.extension,
                    file.size_bytes as i64,
                    file.content_type,
                    file.content_hash,
                    file.declared_hash,
                    file.is_duplicate,
                    file.duplicate_of.map(|id| id.to_string()),
                    file.processing_order as i64,
                    file.priority as i64,
                    file.upload_status.as_str(),
                    file.processing_status.as_str(),
                    file.validation_status.as_str(),
                    file.scan_status.as_str(),
                    file.uploaded_bytes as i64,
                    file.error_count as i64,
                    file.last_error,
                    file.needs_review,
                    file.storage_path,
                    ts(file.created_at),
                    ts(file.updated_at),
                    opt_ts(file.processed_at),
                ],
            )?;

            for (key, value) in &file.metadata {
                tx.execute(
                    "INSERT INTO batch_file_metadata (file_id, key, value) VALUES (?1, ?2, ?3)",
                    params![file.id.to_string(), key, value],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a file by ID
    pub fn get_batch_file(&self, file_id: Uuid) -> Result<Option<BatchFile>> {
        let conn = self.conn.lock();

        let file = conn
            .query_row(
                "SELECT * FROM batch_files WHERE id = ?1",
                params![file_id.to_string()],
                row_to_batch_file,
            )
            .optional()?;

        match file {
            Some(mut file) => {
                file.metadata = load_metadata(&conn, file.id)?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Files of a batch in processing order
    pub fn list_batch_files(&self, batch_id: Uuid) -> Result<Vec<BatchFile>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT * FROM batch_files WHERE batch_id = ?1 ORDER BY processing_order ASC",
        )?;
        let mut files: Vec<BatchFile> = stmt
            .query_map(params![batch_id.to_string()], row_to_batch_file)?
            .collect::<rusqlite::Result<_>>()?;

        for file in &mut files {
            file.metadata = load_metadata(&conn, file.id)?;
        }
        Ok(files)
    }

    /// Processed files of a tenant with a content hash, newest first.
    ///
    /// Files skipped as duplicates count as processed.
    pub fn list_processed_files(&self, tenant_id: Uuid, limit: usize) -> Result<Vec<BatchFile>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT f.* FROM batch_files f
            JOIN batches b ON b.id = f.batch_id
            WHERE f.tenant_id = ?1
              AND b.deleted_at IS NULL
              AND f.processing_status IN ('completed', 'skipped')
              AND f.content_hash IS NOT NULL
            ORDER BY f.created_at DESC, f.id ASC
            LIMIT ?2
            "#,
        )?;
        let mut files: Vec<BatchFile> = stmt
            .query_map(params![tenant_id.to_string(), limit as i64], row_to_batch_file)?
            .collect::<rusqlite::Result<_>>()?;

        for file in &mut files {
            file.metadata = load_metadata(&conn, file.id)?;
        }
        Ok(files)
    }

    /// Next free processing order in a batch
    pub fn next_processing_order(&self, batch_id: Uuid) -> Result<u32> {
        let conn = self.conn.lock();
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(processing_order), 0) + 1 FROM batch_files WHERE batch_id = ?1",
            params![batch_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(next as u32)
    }

    /// Write every mutable column of a file
    pub fn update_batch_file(&self, file: &BatchFile) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            UPDATE batch_files SET
                content_type = ?2,
                content_hash = ?3,
                is_duplicate = ?4,
                duplicate_of = ?5,
                upload_status = ?6,
                processing_status = ?7,
                validation_status = ?8,
                scan_status = ?9,
                uploaded_bytes = ?10,
                error_count = ?11,
                last_error = ?12,
                needs_review = ?13,
                storage_path = ?14,
                updated_at = ?15,
                processed_at = ?16
            WHERE id = ?1
            "#,
            params![
                file.id.to_string(),
                file.content_type,
                file.content_hash,
                file.is_duplicate,
                file.duplicate_of.map(|id| id.to_string()),
                file.upload_status.as_str(),
                file.processing_status.as_str(),
                file.validation_status.as_str(),
                file.scan_status.as_str(),
                file.uploaded_bytes as i64,
                file.error_count as i64,
                file.last_error,
                file.needs_review,
                file.storage_path,
                ts(file.updated_at),
                opt_ts(file.processed_at),
            ],
        )
        .map_err(|e| Error::Internal(format!("Failed to update batch file: {}", e)))?;

        Ok(())
    }

    /// Flag a file as a duplicate of another
    pub fn mark_file_duplicate(
        &self,
        file_id: Uuid,
        duplicate_of: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE batch_files SET is_duplicate = 1, duplicate_of = ?2, updated_at = ?3 WHERE id = ?1",
            params![file_id.to_string(), duplicate_of.to_string(), ts(now)],
        )?;
        Ok(count == 1)
    }

    /// Earliest completed, non-deleted file of the tenant with this hash
    pub fn find_completed_by_hash(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        exclude: Uuid,
    ) -> Result<Option<BatchFile>> {
        let conn = self.conn.lock();

        let file = conn
            .query_row(
                r#"
                SELECT f.* FROM batch_files f
                JOIN batches b ON b.id = f.batch_id
                WHERE f.tenant_id = ?1
                  AND f.content_hash = ?2
                  AND f.id != ?3
                  AND f.processing_status = ?4
                  AND b.deleted_at IS NULL
                ORDER BY f.processed_at ASC, f.id ASC
                LIMIT 1
                "#,
                params![
                    tenant_id.to_string(),
                    content_hash,
                    exclude.to_string(),
                    ProcessingStatus::Completed.as_str(),
                ],
                row_to_batch_file,
            )
            .optional()?;

        Ok(file)
    }

    /// Sum file states for a batch
    pub fn file_aggregates(&self, batch_id: Uuid) -> Result<FileAggregates> {
        let conn = self.conn.lock();

        let agg = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN upload_status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN processing_status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN processing_status = 'failed'
                    OR (upload_status IN ('failed', 'cancelled')
                        AND processing_status NOT IN ('completed', 'skipped'))
                    THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN processing_status = 'skipped' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN processing_status IN ('queued', 'processing') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(needs_review), 0),
                COALESCE(SUM(size_bytes), 0),
                COALESCE(SUM(uploaded_bytes), 0),
                COALESCE(SUM(CASE WHEN processing_status = 'completed' THEN size_bytes ELSE 0 END), 0)
            FROM batch_files WHERE batch_id = ?1
            "#,
            params![batch_id.to_string()],
            |row| {
                Ok(FileAggregates {
                    total_files: row.get::<_, i64>(0)? as u32,
                    uploaded_files: row.get::<_, i64>(1)? as u32,
                    completed_files: row.get::<_, i64>(2)? as u32,
                    failed_files: row.get::<_, i64>(3)? as u32,
                    skipped_files: row.get::<_, i64>(4)? as u32,
                    in_progress_files: row.get::<_, i64>(5)? as u32,
                    needs_review: row.get::<_, i64>(6)? as u32,
                    total_bytes: row.get::<_, i64>(7)? as u64,
                    uploaded_bytes: row.get::<_, i64>(8)? as u64,
                    processed_bytes: row.get::<_, i64>(9)? as u64,
                })
            },
        )?;

        Ok(agg)
    }

    /// Cancel every file of the batch that has not settled
    pub fn cancel_open_files(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE batch_files SET
                upload_status = CASE WHEN upload_status IN ('pending', 'uploading')
                    THEN 'cancelled' ELSE upload_status END,
                processing_status = 'skipped',
                last_error = COALESCE(last_error, 'batch cancelled'),
                updated_at = ?2
            WHERE batch_id = ?1 AND processing_status NOT IN ('completed', 'failed', 'skipped')
            "#,
            params![batch_id.to_string(), ts(now)],
        )?;
        Ok(count)
    }
}

fn active_batch_count(conn: &Connection, tenant_id: Uuid) -> Result<u32> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM batches WHERE tenant_id = ?1 AND deleted_at IS NULL AND status IN ({})",
            ACTIVE_BATCH_STATUSES
        ),
        params![tenant_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn load_batch(conn: &Connection, batch_id: Uuid) -> Result<Option<Batch>> {
    let batch = conn
        .query_row(
            "SELECT * FROM batches WHERE id = ?1",
            params![batch_id.to_string()],
            row_to_batch,
        )
        .optional()?;

    match batch {
        Some(mut batch) => {
            batch.limits.allowed_extensions = load_batch_extensions(conn, batch.id)?;
            Ok(Some(batch))
        }
        None => Ok(None),
    }
}

fn load_batch_extensions(conn: &Connection, batch_id: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT extension FROM batch_allowed_extensions WHERE batch_id = ?1 ORDER BY extension",
    )?;
    let extensions = stmt
        .query_map(params![batch_id.to_string()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(extensions)
}

fn load_metadata(conn: &Connection, file_id: Uuid) -> Result<BTreeMap<String, String>> {
    let mut stmt =
        conn.prepare_cached("SELECT key, value FROM batch_file_metadata WHERE file_id = ?1")?;
    let metadata = stmt
        .query_map(params![file_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(metadata)
}

fn row_to_batch(row: &Row) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        name: row.get("name")?,
        batch_number: row.get("batch_number")?,
        status: get_enum(row, "status")?,
        total_files: get_u32(row, "total_files")?,
        uploaded_files: get_u32(row, "uploaded_files")?,
        processed_files: get_u32(row, "processed_files")?,
        failed_files: get_u32(row, "failed_files")?,
        skipped_files: get_u32(row, "skipped_files")?,
        total_bytes: get_u64(row, "total_bytes")?,
        uploaded_bytes: get_u64(row, "uploaded_bytes")?,
        processed_bytes: get_u64(row, "processed_bytes")?,
        progress: row.get("progress")?,
        limits: BatchLimits {
            max_files: get_u32(row, "max_files")?,
            max_total_bytes: get_u64(row, "max_total_bytes")?,
            max_file_size: get_u64(row, "max_file_size")?,
            allowed_extensions: Vec::new(),
        },
        duplicate_policy: get_enum(row, "duplicate_policy")?,
        concurrency_mode: get_enum(row, "concurrency_mode")?,
        priority: get_u32(row, "priority")? as u8,
        error: row.get("error")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        started_at: get_opt_ts(row, "started_at")?,
        completed_at: get_opt_ts(row, "completed_at")?,
        deleted_at: get_opt_ts(row, "deleted_at")?,
    })
}

fn row_to_batch_file(row: &Row) -> rusqlite::Result<BatchFile> {
    Ok(BatchFile {
        id: get_uuid(row, "id")?,
        batch_id: get_uuid(row, "batch_id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        original_filename: row.get("original_filename")?,
        sanitized_filename: row.get("sanitized_filename")?,
        extension: row.get("extension")?,
        size_bytes: get_u64(row, "size_bytes")?,
        content_type: row.get("content_type")?,
        content_hash: row.get("content_hash")?,
        declared_hash: row.get("declared_hash")?,
        is_duplicate: get_bool(row, "is_duplicate")?,
        duplicate_of: get_opt_uuid(row, "duplicate_of")?,
        processing_order: get_u32(row, "processing_order")?,
        priority: get_u32(row, "priority")? as u8,
        upload_status: get_enum(row, "upload_status")?,
        processing_status: get_enum(row, "processing_status")?,
        validation_status: get_enum(row, "validation_status")?,
        scan_status: get_enum(row, "scan_status")?,
        uploaded_bytes: get_u64(row, "uploaded_bytes")?,
        error_count: get_u32(row, "error_count")?,
        last_error: row.get("last_error")?,
        needs_review: get_bool(row, "needs_review")?,
        storage_path: row.get("storage_path")?,
        metadata: BTreeMap::new(),
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        processed_at: get_opt_ts(row, "processed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConcurrencyMode, DuplicatePolicy, ScanStatus, UploadStatus, ValidationStatus,
    };

    fn sample_batch(tenant_id: Uuid) -> Batch {
        let now = Utc::now();
        Batch {
            id: Uuid::new_v4(),
            tenant_id,
            name: "Q1 protokoll".to_string(),
            batch_number: 0,
            status: BatchStatus::Pending,
            total_files: 0,
            uploaded_files: 0,
            processed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            total_bytes: 0,
            uploaded_bytes: 0,
            processed_bytes: 0,
            progress: 0.0,
            limits: BatchLimits {
                max_files: 10,
                max_total_bytes: 100,
                max_file_size: 50,
                allowed_extensions: vec!["pdf".to_string()],
            },
            duplicate_policy: DuplicatePolicy::Flag,
            concurrency_mode: ConcurrencyMode::Parallel,
            priority: 5,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deleted_at: None,
        }
    }

    fn sample_file(batch: &Batch, order: u32) -> BatchFile {
        let now = Utc::now();
        BatchFile {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            tenant_id: batch.tenant_id,
            original_filename: format!("doc {}.pdf", order),
            sanitized_filename: format!("doc {}.pdf", order),
            extension: "pdf".to_string(),
            size_bytes: 10,
            content_type: "application/pdf".to_string(),
            content_hash: None,
            declared_hash: None,
            is_duplicate: false,
            duplicate_of: None,
            processing_order: order,
            priority: 5,
            upload_status: UploadStatus::Pending,
            processing_status: ProcessingStatus::Pending,
            validation_status: ValidationStatus::Valid,
            scan_status: ScanStatus::Pending,
            uploaded_bytes: 0,
            error_count: 0,
            last_error: None,
            needs_review: false,
            storage_path: None,
            metadata: BTreeMap::from([("title".to_string(), "Stämma".to_string())]),
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    #[test]
    fn test_batch_numbers_are_per_tenant() {
        let db = IngestDb::in_memory().unwrap();
        let tenant = Uuid::new_v4();

        let mut first = sample_batch(tenant);
        let mut second = sample_batch(tenant);
        let mut other = sample_batch(Uuid::new_v4());
        db.insert_batch(&mut first).unwrap();
        db.insert_batch(&mut second).unwrap();
        db.insert_batch(&mut other).unwrap();

        assert_eq!(first.batch_number, 1);
        assert_eq!(second.batch_number, 2);
        assert_eq!(other.batch_number, 1);

        let loaded = db.get_batch(first.id).unwrap().unwrap();
        assert_eq!(loaded.limits.allowed_extensions, vec!["pdf".to_string()]);
        assert_eq!(db.count_active_batches(tenant).unwrap(), 2);
    }

    #[test]
    fn test_insert_below_refuses_at_ceiling() {
        let db = IngestDb::in_memory().unwrap();
        let tenant = Uuid::new_v4();

        let mut first = sample_batch(tenant);
        assert_eq!(db.insert_batch_below(&mut first, 1).unwrap(), 0);
        let mut second = sample_batch(tenant);
        assert_eq!(db.insert_batch_below(&mut second, 1).unwrap(), 1);

        assert!(db.get_batch(second.id).unwrap().is_none());
        assert_eq!(db.count_active_batches(tenant).unwrap(), 1);
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let db = IngestDb::in_memory().unwrap();
        let mut batch = sample_batch(Uuid::new_v4());
        db.insert_batch(&mut batch).unwrap();

        let now = Utc::now();
        assert!(db
            .transition_batch(batch.id, &[BatchStatus::Pending], BatchStatus::Validating, None, now)
            .unwrap());
        assert!(!db
            .transition_batch(batch.id, &[BatchStatus::Pending], BatchStatus::Validating, None, now)
            .unwrap());
    }

    #[test]
    fn test_aggregates_follow_file_states() {
        let db = IngestDb::in_memory().unwrap();
        let mut batch = sample_batch(Uuid::new_v4());
        db.insert_batch(&mut batch).unwrap();

        let mut files: Vec<BatchFile> = (1..=3).map(|i| sample_file(&batch, i)).collect();
        db.insert_batch_files(&files).unwrap();

        files[0].upload_status = UploadStatus::Completed;
        files[0].uploaded_bytes = 10;
        files[0].processing_status = ProcessingStatus::Completed;
        db.update_batch_file(&files[0]).unwrap();
        files[1].upload_status = UploadStatus::Failed;
        db.update_batch_file(&files[1]).unwrap();

        let agg = db.file_aggregates(batch.id).unwrap();
        assert_eq!(agg.total_files, 3);
        assert_eq!(agg.completed_files, 1);
        assert_eq!(agg.failed_files, 1);
        assert_eq!(agg.finished_files(), 2);
        assert_eq!(agg.total_bytes, 30);
        assert_eq!(agg.processed_bytes, 10);

        let loaded = db.get_batch_file(files[0].id).unwrap().unwrap();
        assert_eq!(loaded.metadata.get("title").map(String::as_str), Some("Stämma"));
    }

    #[test]
    fn test_tenant_settings_round_trip() {
        let db = IngestDb::in_memory().unwrap();
        let tenant = Uuid::new_v4();
        assert!(db.get_tenant_settings(tenant).unwrap().is_none());

        db.put_tenant_settings(&TenantSettings {
            tenant_id: tenant,
            max_files_per_batch: Some(10),
            allowed_extensions: Some(vec!["PDF".to_string()]),
            ..Default::default()
        })
        .unwrap();

        let settings = db.get_tenant_settings(tenant).unwrap().unwrap();
        assert_eq!(settings.max_files_per_batch, Some(10));
        assert_eq!(settings.allowed_extensions, Some(vec!["pdf".to_string()]));
        assert_eq!(settings.max_batch_bytes, None);
    }
}
