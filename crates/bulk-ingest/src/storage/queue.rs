//! Queue item persistence
//!
//! Readiness (dependencies, retry delay, schedule window, expiry) is decided
//! in SQL so every scheduler sees the same answer.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::database::{
    get_enum, get_opt_ts, get_opt_uuid, get_ts, get_u32, get_u64, get_uuid, opt_ts, ts,
    IngestDb,
};
use crate::error::Result;
use crate::types::{
    BatchStatus, DbEnum, QueueItem, QueueItemStatus, QueueStats, ResourceRequirements,
};

impl IngestDb {
    /// Insert an item with its dependency and file type rows
    pub fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = item.id.to_string();

        tx.execute(
            r#"
            INSERT INTO queue_items (
                id, tenant_id, batch_id, queue_type, priority, position, status, worker_type,
                assigned_worker, memory_mb, cpu_cores, disk_mb, retry_count, max_retries,
                next_retry_at, scheduled_at, expires_at, max_processing_secs, started_at,
                completed_at, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            "#,
            params![
                id,
                item.tenant_id.to_string(),
                item.batch_id.to_string(),
                item.queue_type.as_str(),
                item.priority as i64,
                item.position as i64,
                item.status.as_str(),
                item.worker_type.as_str(),
                item.assigned_worker.map(|w| w.to_string()),
                item.resources.memory_mb as i64,
                item.resources.cpu_cores as i64,
                item.resources.disk_mb as i64,
                item.retry_count as i64,
                item.max_retries as i64,
                opt_ts(item.next_retry_at),
                ts(item.scheduled_at),
                opt_ts(item.expires_at),
                item.max_processing_secs as i64,
                opt_ts(item.started_at),
                opt_ts(item.completed_at),
                item.last_error,
                ts(item.created_at),
                ts(item.updated_at),
            ],
        )?;

        for dep in &item.dependencies {
            tx.execute(
                "INSERT OR IGNORE INTO queue_item_dependencies (item_id, batch_id) VALUES (?1, ?2)",
                params![id, dep.to_string()],
            )?;
        }
        for file_type in &item.required_file_types {
            tx.execute(
                "INSERT OR IGNORE INTO queue_item_file_types (item_id, file_type) VALUES (?1, ?2)",
                params![id, file_type],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get an item by ID
    pub fn get_queue_item(&self, item_id: Uuid) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock();
        load_queue_item(&conn, item_id)
    }

    /// Most recent item created for a batch
    pub fn latest_queue_item_for_batch(&self, batch_id: Uuid) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                "SELECT * FROM queue_items WHERE batch_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![batch_id.to_string()],
                row_to_queue_item,
            )
            .optional()?;
        attach_one(&conn, item)
    }

    /// Items in one status, in queue order
    pub fn list_queue_items(&self, status: QueueItemStatus) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM queue_items WHERE status = ?1 ORDER BY priority ASC, position ASC, created_at ASC",
        )?;
        let items: Vec<QueueItem> = stmt
            .query_map(params![status.as_str()], row_to_queue_item)?
            .collect::<rusqlite::Result<_>>()?;
        attach_all(&conn, items)
    }

    /// Running items assigned to one worker
    pub fn list_assigned_items(&self, worker_id: Uuid) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM queue_items WHERE assigned_worker = ?1 AND status = 'running' ORDER BY started_at ASC",
        )?;
        let items: Vec<QueueItem> = stmt
            .query_map(params![worker_id.to_string()], row_to_queue_item)?
            .collect::<rusqlite::Result<_>>()?;
        attach_all(&conn, items)
    }

    /// Queued items eligible to run at `now`, best first.
    ///
    /// An item is ready when its schedule window has opened, its retry delay
    /// has passed, it has not expired and every dependency batch completed.
    pub fn ready_queue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let now = ts(now);

        let mut stmt = conn.prepare(
            r#"
            SELECT q.* FROM queue_items q
            WHERE q.status = 'queued'
              AND q.scheduled_at <= ?1
              AND (q.next_retry_at IS NULL OR q.next_retry_at <= ?1)
              AND (q.expires_at IS NULL OR q.expires_at > ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM queue_item_dependencies d
                  LEFT JOIN batches b ON b.id = d.batch_id
                  WHERE d.item_id = q.id
                    AND (b.id IS NULL OR b.status != ?2)
              )
            ORDER BY q.priority ASC, q.position ASC, q.created_at ASC
            LIMIT ?3
            "#,
        )?;
        let items: Vec<QueueItem> = stmt
            .query_map(
                params![now, BatchStatus::Completed.as_str(), limit as i64],
                row_to_queue_item,
            )?
            .collect::<rusqlite::Result<_>>()?;
        attach_all(&conn, items)
    }

    /// Renumber queued items 1..n by (priority, creation time, id)
    pub fn recompute_queue_positions(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM queue_items WHERE status = 'queued' ORDER BY priority ASC, created_at ASC, id ASC",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            ids
        };

        for (index, id) in ids.iter().enumerate() {
            tx.execute(
                "UPDATE queue_items SET position = ?2 WHERE id = ?1",
                params![id, (index + 1) as i64],
            )?;
        }
        tx.execute(
            "UPDATE queue_items SET position = 0 WHERE status != 'queued' AND position != 0",
            [],
        )?;

        tx.commit()?;
        Ok(ids.len())
    }

    /// `queued -> running` guarded on the current status
    pub fn assign_queue_item(
        &self,
        item_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE queue_items SET
                status = 'running',
                assigned_worker = ?2,
                started_at = ?3,
                updated_at = ?3
            WHERE id = ?1 AND status = 'queued'
            "#,
            params![item_id.to_string(), worker_id.to_string(), ts(now)],
        )?;
        Ok(count == 1)
    }

    /// `running -> completed`, only for the worker that holds the item
    pub fn complete_queue_item(
        &self,
        item_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE queue_items SET status = 'completed', completed_at = ?3, updated_at = ?3
            WHERE id = ?1 AND status = 'running' AND assigned_worker = ?2
            "#,
            params![item_id.to_string(), worker_id.to_string(), ts(now)],
        )?;
        Ok(count == 1)
    }

    /// `running -> queued` with a bumped retry count and backoff
    pub fn requeue_queue_item(
        &self,
        item_id: Uuid,
        expected_retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE queue_items SET
                status = 'queued',
                retry_count = retry_count + 1,
                next_retry_at = ?3,
                assigned_worker = NULL,
                started_at = NULL,
                last_error = ?4,
                updated_at = ?5
            WHERE id = ?1 AND status = 'running' AND retry_count = ?2
            "#,
            params![
                item_id.to_string(),
                expected_retry_count as i64,
                ts(next_retry_at),
                error,
                ts(now),
            ],
        )?;
        Ok(count == 1)
    }

    /// `running -> failed` once the retry budget is spent
    pub fn fail_queue_item(
        &self,
        item_id: Uuid,
        expected_retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE queue_items SET
                status = 'failed',
                last_error = ?3,
                completed_at = ?4,
                updated_at = ?4
            WHERE id = ?1 AND status = 'running' AND retry_count = ?2
            "#,
            params![item_id.to_string(), expected_retry_count as i64, error, ts(now)],
        )?;
        Ok(count == 1)
    }

    /// Generic guarded status change for pause/resume/cancel/reap
    pub fn transition_queue_item(
        &self,
        item_id: Uuid,
        from: &[QueueItemStatus],
        to: QueueItemStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let allowed: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            r#"
            UPDATE queue_items SET
                status = ?2,
                last_error = COALESCE(?3, last_error),
                assigned_worker = CASE WHEN ?2 = 'queued' THEN NULL ELSE assigned_worker END,
                started_at = CASE WHEN ?2 = 'queued' THEN NULL ELSE started_at END,
                completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END,
                updated_at = ?4
            WHERE id = ?1 AND status IN ({})
            "#,
            allowed.join(", ")
        );
        let count = conn.execute(
            &sql,
            params![item_id.to_string(), to.as_str(), error, ts(now), to.is_terminal()],
        )?;
        Ok(count == 1)
    }

    /// Expire queued items past their deadline, returning them as expired
    pub fn expire_queue_items(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM queue_items
                WHERE status = 'queued' AND expires_at IS NOT NULL AND expires_at <= ?1
                "#,
            )?;
            let ids = stmt
                .query_map(params![ts(now)], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            ids
        };

        let mut expired = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                r#"
                UPDATE queue_items SET
                    status = 'expired',
                    last_error = COALESCE(last_error, 'expired before it could run'),
                    completed_at = ?2,
                    updated_at = ?2
                WHERE id = ?1 AND status = 'queued'
                "#,
                params![id, ts(now)],
            )?;
            let item = tx
                .query_row(
                    "SELECT * FROM queue_items WHERE id = ?1",
                    params![id],
                    row_to_queue_item,
                )
                .optional()?;
            expired.extend(item);
        }
        let expired = attach_all(&tx, expired)?;

        tx.commit()?;
        Ok(expired)
    }

    /// Delete terminal items last touched before `before`
    pub fn delete_terminal_queue_items(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            DELETE FROM queue_items
            WHERE status IN ('completed', 'failed', 'cancelled', 'expired') AND updated_at < ?1
            "#,
            params![ts(before)],
        )?;
        Ok(count)
    }

    /// Counts by status
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match QueueItemStatus::from_db(&status) {
                Some(QueueItemStatus::Queued) => stats.queued = count,
                Some(QueueItemStatus::Running) => stats.running = count,
                Some(QueueItemStatus::Paused) => stats.paused = count,
                Some(QueueItemStatus::Completed) => stats.completed = count,
                Some(QueueItemStatus::Failed) => stats.failed = count,
                Some(QueueItemStatus::Cancelled) => stats.cancelled = count,
                Some(QueueItemStatus::Expired) => stats.expired = count,
                None => tracing::warn!("Unknown queue status in database: {}", status),
            }
        }
        Ok(stats)
    }
}

fn load_queue_item(conn: &Connection, item_id: Uuid) -> Result<Option<QueueItem>> {
    let item = conn
        .query_row(
            "SELECT * FROM queue_items WHERE id = ?1",
            params![item_id.to_string()],
            row_to_queue_item,
        )
        .optional()?;
    attach_one(conn, item)
}

fn attach_one(conn: &Connection, item: Option<QueueItem>) -> Result<Option<QueueItem>> {
    match item {
        Some(mut item) => {
            attach_associations(conn, &mut item)?;
            Ok(Some(item))
        }
        None => Ok(None),
    }
}

fn attach_all(conn: &Connection, mut items: Vec<QueueItem>) -> Result<Vec<QueueItem>> {
    for item in &mut items {
        attach_associations(conn, item)?;
    }
    Ok(items)
}

fn attach_associations(conn: &Connection, item: &mut QueueItem) -> Result<()> {
    let id = item.id.to_string();

    let mut deps = conn.prepare_cached(
        "SELECT batch_id FROM queue_item_dependencies WHERE item_id = ?1 ORDER BY batch_id",
    )?;
    item.dependencies = deps
        .query_map(params![id], |row| {
            let raw: String = row.get(0)?;
            Uuid::parse_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
            })
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut types = conn.prepare_cached(
        "SELECT file_type FROM queue_item_file_types WHERE item_id = ?1 ORDER BY file_type",
    )?;
    item.required_file_types = types
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    Ok(())
}

fn row_to_queue_item(row: &Row) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        batch_id: get_uuid(row, "batch_id")?,
        queue_type: get_enum(row, "queue_type")?,
        priority: get_u32(row, "priority")? as u8,
        position: get_u32(row, "position")?,
        status: get_enum(row, "status")?,
        worker_type: get_enum(row, "worker_type")?,
        required_file_types: Vec::new(),
        assigned_worker: get_opt_uuid(row, "assigned_worker")?,
        resources: ResourceRequirements {
            memory_mb: get_u64(row, "memory_mb")?,
            cpu_cores: get_u32(row, "cpu_cores")?,
            disk_mb: get_u64(row, "disk_mb")?,
        },
        dependencies: Vec::new(),
        retry_count: get_u32(row, "retry_count")?,
        max_retries: get_u32(row, "max_retries")?,
        next_retry_at: get_opt_ts(row, "next_retry_at")?,
        scheduled_at: get_ts(row, "scheduled_at")?,
        expires_at: get_opt_ts(row, "expires_at")?,
        max_processing_secs: get_u64(row, "max_processing_secs")?,
        started_at: get_opt_ts(row, "started_at")?,
        completed_at: get_opt_ts(row, "completed_at")?,
        last_error: row.get("last_error")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}
