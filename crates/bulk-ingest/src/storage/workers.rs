//! Worker registry persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::database::{get_enum, get_ts, get_u32, get_u64, get_uuid, ts, IngestDb};
use crate::error::Result;
use crate::types::{
    DbEnum, ResourceRequirements, Worker, WorkerCapacity, WorkerHealth, WorkerLoad, WorkerStatus,
};

impl IngestDb {
    /// Insert a worker and its supported file types
    pub fn insert_worker(&self, worker: &Worker) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = worker.id.to_string();

        tx.execute(
            r#"
            INSERT INTO workers (
                id, name, worker_type, status, health, max_concurrent_batches,
                max_concurrent_files, memory_mb, cpu_cores, load_batches, load_memory_mb,
                load_cpu_cores, last_heartbeat, registered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                id,
                worker.name,
                worker.worker_type.as_str(),
                worker.status.as_str(),
                worker.health.as_str(),
                worker.capacity.max_concurrent_batches as i64,
                worker.capacity.max_concurrent_files as i64,
                worker.capacity.memory_mb as i64,
                worker.capacity.cpu_cores as i64,
                worker.load.current_batches as i64,
                worker.load.memory_mb as i64,
                worker.load.cpu_cores as i64,
                ts(worker.last_heartbeat),
                ts(worker.registered_at),
            ],
        )?;

        for file_type in &worker.capacity.supported_file_types {
            tx.execute(
                "INSERT OR IGNORE INTO worker_file_types (worker_id, file_type) VALUES (?1, ?2)",
                params![id, file_type],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a worker by ID
    pub fn get_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        let conn = self.conn.lock();
        let worker = conn
            .query_row(
                "SELECT * FROM workers WHERE id = ?1",
                params![worker_id.to_string()],
                row_to_worker,
            )
            .optional()?;

        match worker {
            Some(mut worker) => {
                worker.capacity.supported_file_types = load_file_types(&conn, worker.id)?;
                Ok(Some(worker))
            }
            None => Ok(None),
        }
    }

    /// All registered workers, oldest registration first
    pub fn list_workers(&self) -> Result<Vec<Worker>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY registered_at ASC, id ASC")?;
        let mut workers: Vec<Worker> = stmt
            .query_map([], row_to_worker)?
            .collect::<rusqlite::Result<_>>()?;

        for worker in &mut workers {
            worker.capacity.supported_file_types = load_file_types(&conn, worker.id)?;
        }
        Ok(workers)
    }

    /// Record a heartbeat; offline workers come back idle or busy
    pub fn touch_worker(
        &self,
        worker_id: Uuid,
        health: WorkerHealth,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE workers SET
                last_heartbeat = ?2,
                health = ?3,
                status = CASE
                    WHEN status = 'offline' AND load_batches >= max_concurrent_batches THEN 'busy'
                    WHEN status = 'offline' THEN 'idle'
                    ELSE status
                END
            WHERE id = ?1
            "#,
            params![worker_id.to_string(), ts(now), health.as_str()],
        )?;
        Ok(count == 1)
    }

    /// Set a worker's status unconditionally
    pub fn set_worker_status(&self, worker_id: Uuid, status: WorkerStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE workers SET status = ?2 WHERE id = ?1",
            params![worker_id.to_string(), status.as_str()],
        )?;
        Ok(count == 1)
    }

    /// Atomically take capacity for one batch.
    ///
    /// Succeeds only while the worker is idle and healthy with enough spare
    /// memory, CPU and batch slots; otherwise nothing changes.
    pub fn reserve_worker_capacity(
        &self,
        worker_id: Uuid,
        req: &ResourceRequirements,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE workers SET
                load_batches = load_batches + 1,
                load_memory_mb = load_memory_mb + ?2,
                load_cpu_cores = load_cpu_cores + ?3,
                status = CASE WHEN load_batches + 1 >= max_concurrent_batches
                    THEN 'busy' ELSE 'idle' END
            WHERE id = ?1
              AND status = 'idle'
              AND health = 'healthy'
              AND load_batches < max_concurrent_batches
              AND memory_mb - load_memory_mb >= ?2
              AND cpu_cores - load_cpu_cores >= ?3
            "#,
            params![worker_id.to_string(), req.memory_mb as i64, req.cpu_cores as i64],
        )?;
        Ok(count == 1)
    }

    /// Give back capacity taken by `reserve_worker_capacity`
    pub fn release_worker_capacity(
        &self,
        worker_id: Uuid,
        req: &ResourceRequirements,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE workers SET
                load_batches = MAX(load_batches - 1, 0),
                load_memory_mb = MAX(load_memory_mb - ?2, 0),
                load_cpu_cores = MAX(load_cpu_cores - ?3, 0),
                status = CASE WHEN status = 'busy' THEN 'idle' ELSE status END
            WHERE id = ?1
            "#,
            params![worker_id.to_string(), req.memory_mb as i64, req.cpu_cores as i64],
        )?;
        Ok(count == 1)
    }

    /// Mark workers silent since `cutoff` offline, returning their IDs
    pub fn mark_stale_workers_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let ids: Vec<Uuid> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM workers WHERE status != 'offline' AND last_heartbeat < ?1",
            )?;
            let ids = stmt
                .query_map(params![ts(cutoff)], |row| get_uuid(row, "id"))?
                .collect::<rusqlite::Result<_>>()?;
            ids
        };

        for id in &ids {
            tx.execute(
                "UPDATE workers SET status = 'offline' WHERE id = ?1",
                params![id.to_string()],
            )?;
        }

        tx.commit()?;
        Ok(ids)
    }
}

fn load_file_types(conn: &Connection, worker_id: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT file_type FROM worker_file_types WHERE worker_id = ?1 ORDER BY file_type",
    )?;
    let types = stmt
        .query_map(params![worker_id.to_string()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(types)
}

fn row_to_worker(row: &Row) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: get_uuid(row, "id")?,
        name: row.get("name")?,
        worker_type: get_enum(row, "worker_type")?,
        status: get_enum(row, "status")?,
        health: get_enum(row, "health")?,
        capacity: WorkerCapacity {
            max_concurrent_batches: get_u32(row, "max_concurrent_batches")?,
            max_concurrent_files: get_u32(row, "max_concurrent_files")?,
            memory_mb: get_u64(row, "memory_mb")?,
            cpu_cores: get_u32(row, "cpu_cores")?,
            supported_file_types: Vec::new(),
        },
        load: WorkerLoad {
            current_batches: get_u32(row, "load_batches")?,
            memory_mb: get_u64(row, "load_memory_mb")?,
            cpu_cores: get_u32(row, "load_cpu_cores")?,
        },
        last_heartbeat: get_ts(row, "last_heartbeat")?,
        registered_at: get_ts(row, "registered_at")?,
    })
}
