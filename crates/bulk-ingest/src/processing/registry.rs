//! Worker registry
//!
//! Tracks worker processes, their health and load, and matches queue items
//! to capable workers. Capacity is taken and returned with guarded updates so
//! two schedulers can never overcommit the same worker.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::events::EventLogger;
use crate::storage::IngestDb;
use crate::types::{
    QueueItem, ResourceRequirements, Worker, WorkerHealth, WorkerLoad, WorkerRegistration,
    WorkerStatus,
};

/// Registry of processing workers
pub struct WorkerRegistry {
    db: IngestDb,
    config: WorkerConfig,
    events: Arc<dyn EventLogger>,
}

impl WorkerRegistry {
    pub fn new(db: IngestDb, config: WorkerConfig, events: Arc<dyn EventLogger>) -> Self {
        Self { db, config, events }
    }

    /// Register a worker at startup
    pub fn register(&self, registration: WorkerRegistration) -> Result<Worker> {
        let capacity = &registration.capacity;
        if capacity.max_concurrent_batches == 0 || capacity.memory_mb == 0 || capacity.cpu_cores == 0 {
            return Err(Error::validation(
                "Worker capacity needs at least one batch slot, some memory and one core",
            ));
        }
        if registration.name.trim().is_empty() {
            return Err(Error::validation("Worker name must not be empty"));
        }

        let mut capacity = registration.capacity.clone();
        capacity.supported_file_types = capacity
            .supported_file_types
            .iter()
            .map(|t| t.trim_start_matches('.').to_lowercase())
            .collect();

        let now = Utc::now();
        let worker = Worker {
            id: Uuid::new_v4(),
            name: registration.name,
            worker_type: registration.worker_type,
            status: WorkerStatus::Idle,
            health: WorkerHealth::Healthy,
            capacity,
            load: WorkerLoad::default(),
            last_heartbeat: now,
            registered_at: now,
        };
        self.db.insert_worker(&worker)?;

        self.events.info(
            None,
            "worker.registered",
            &format!("Worker '{}' registered as {}", worker.name, worker.worker_type),
            json!({
                "worker_id": worker.id,
                "worker_type": worker.worker_type,
                "max_concurrent_batches": worker.capacity.max_concurrent_batches,
                "memory_mb": worker.capacity.memory_mb,
            }),
        );
        Ok(worker)
    }

    pub fn get(&self, worker_id: Uuid) -> Result<Worker> {
        self.db
            .get_worker(worker_id)?
            .ok_or_else(|| Error::not_found("worker", worker_id))
    }

    pub fn list(&self) -> Result<Vec<Worker>> {
        self.db.list_workers()
    }

    /// Record a heartbeat with the worker's self-reported health
    pub fn heartbeat(&self, worker_id: Uuid, health: WorkerHealth) -> Result<Worker> {
        if !self.db.touch_worker(worker_id, health, Utc::now())? {
            return Err(Error::not_found("worker", worker_id));
        }
        self.get(worker_id)
    }

    /// Stop handing new work to a worker
    pub fn drain(&self, worker_id: Uuid) -> Result<()> {
        if !self.db.set_worker_status(worker_id, WorkerStatus::Draining)? {
            return Err(Error::not_found("worker", worker_id));
        }
        self.events.info(
            None,
            "worker.draining",
            &format!("Worker {} draining", worker_id),
            json!({ "worker_id": worker_id }),
        );
        Ok(())
    }

    /// Capable workers for an item, best first
    pub fn candidates_for(&self, item: &QueueItem, now: DateTime<Utc>) -> Result<Vec<Worker>> {
        let cutoff = self.heartbeat_cutoff(now);
        Ok(rank_workers(self.db.list_workers()?, item, cutoff))
    }

    /// Best capable worker for an item
    pub fn find_worker(&self, item: &QueueItem, now: DateTime<Utc>) -> Result<Option<Worker>> {
        Ok(self.candidates_for(item, now)?.into_iter().next())
    }

    /// Take capacity for one item; false when a concurrent scheduler won
    pub fn reserve(&self, worker_id: Uuid, req: &ResourceRequirements) -> Result<bool> {
        self.db.reserve_worker_capacity(worker_id, req)
    }

    /// Return capacity held by a finished or reaped item
    pub fn release(&self, worker_id: Uuid, req: &ResourceRequirements) -> Result<()> {
        if !self.db.release_worker_capacity(worker_id, req)? {
            tracing::warn!("Release for unknown worker {}", worker_id);
        }
        Ok(())
    }

    /// Mark workers without a recent heartbeat offline
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let stale = self.db.mark_stale_workers_offline(self.heartbeat_cutoff(now))?;
        for worker_id in &stale {
            self.events.warn(
                None,
                "worker.offline",
                &format!(
                    "Worker {} missed heartbeats for {}s, marked offline",
                    worker_id, self.config.heartbeat_timeout_secs
                ),
                json!({ "worker_id": worker_id }),
            );
        }
        Ok(stale)
    }

    fn heartbeat_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.heartbeat_timeout_secs as i64)
    }
}

/// Filter workers able to run `item` and order them best first.
///
/// Eligible: serves the item's type, idle, healthy, heartbeat at or after
/// `cutoff`, enough headroom, handles every file type. Order: exact type
/// match, most spare memory, most spare batch slots, fewest current batches,
/// then worker id.
pub fn rank_workers(workers: Vec<Worker>, item: &QueueItem, cutoff: DateTime<Utc>) -> Vec<Worker> {
    let mut eligible: Vec<Worker> = workers
        .into_iter()
        .filter(|w| {
            w.worker_type.serves(item.worker_type)
                && w.status == WorkerStatus::Idle
                && w.health == WorkerHealth::Healthy
                && w.last_heartbeat >= cutoff
                && w.has_headroom(&item.resources)
                && w.supports(&item.required_file_types)
        })
        .collect();

    eligible.sort_by(|a, b| compare_workers(a, b, item));
    eligible
}

fn compare_workers(a: &Worker, b: &Worker, item: &QueueItem) -> Ordering {
    let exact_a = a.worker_type == item.worker_type;
    let exact_b = b.worker_type == item.worker_type;

    exact_b
        .cmp(&exact_a)
        .then_with(|| b.spare_memory_mb().cmp(&a.spare_memory_mb()))
        .then_with(|| b.spare_batches().cmp(&a.spare_batches()))
        .then_with(|| a.load.current_batches.cmp(&b.load.current_batches))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventLog;
    use crate::types::{QueueItemStatus, QueueType, WorkerCapacity, WorkerType};

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(
            IngestDb::in_memory().unwrap(),
            WorkerConfig::default(),
            Arc::new(TracingEventLog),
        )
    }

    fn registration(name: &str, worker_type: WorkerType, memory_mb: u64) -> WorkerRegistration {
        WorkerRegistration {
            name: name.to_string(),
            worker_type,
            capacity: WorkerCapacity {
                max_concurrent_batches: 2,
                max_concurrent_files: 4,
                memory_mb,
                cpu_cores: 4,
                supported_file_types: vec![],
            },
        }
    }

    fn item(worker_type: WorkerType, memory_mb: u64) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            queue_type: QueueType::Processing,
            priority: 5,
            position: 1,
            status: QueueItemStatus::Queued,
            worker_type,
            required_file_types: vec!["pdf".to_string()],
            assigned_worker: None,
            resources: ResourceRequirements {
                memory_mb,
                cpu_cores: 1,
                disk_mb: 1,
            },
            dependencies: vec![],
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            scheduled_at: now,
            expires_at: None,
            max_processing_secs: 60,
            started_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_prefers_exact_type_then_spare_memory() {
        let registry = registry();
        let big_default = registry
            .register(registration("big-default", WorkerType::Default, 16_384))
            .unwrap();
        let small_fast = registry
            .register(registration("small-fast", WorkerType::Fast, 1024))
            .unwrap();
        let big_fast = registry
            .register(registration("big-fast", WorkerType::Fast, 8192))
            .unwrap();

        let ranked = registry.candidates_for(&item(WorkerType::Fast, 512), Utc::now()).unwrap();
        let ids: Vec<Uuid> = ranked.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![big_fast.id, small_fast.id, big_default.id]);
    }

    #[test]
    fn test_excludes_unfit_workers() {
        let registry = registry();
        let heavy = registry
            .register(registration("heavy", WorkerType::Heavy, 4096))
            .unwrap();
        let mut png_only = registration("png-only", WorkerType::Default, 4096);
        png_only.capacity.supported_file_types = vec![".PNG".to_string()];
        registry.register(png_only).unwrap();

        // Wrong type for a fast item, png-only cannot take pdf
        assert!(registry
            .find_worker(&item(WorkerType::Fast, 512), Utc::now())
            .unwrap()
            .is_none());

        // Not enough memory
        assert!(registry
            .find_worker(&item(WorkerType::Heavy, 10_000), Utc::now())
            .unwrap()
            .is_none());

        // Unhealthy
        registry.heartbeat(heavy.id, WorkerHealth::Unhealthy).unwrap();
        assert!(registry
            .find_worker(&item(WorkerType::Heavy, 512), Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reserve_until_busy_then_release() {
        let registry = registry();
        let worker = registry
            .register(registration("w", WorkerType::Default, 4096))
            .unwrap();
        let req = ResourceRequirements {
            memory_mb: 1024,
            cpu_cores: 1,
            disk_mb: 1,
        };

        assert!(registry.reserve(worker.id, &req).unwrap());
        assert!(registry.reserve(worker.id, &req).unwrap());
        assert!(!registry.reserve(worker.id, &req).unwrap());
        assert_eq!(registry.get(worker.id).unwrap().status, WorkerStatus::Busy);

        registry.release(worker.id, &req).unwrap();
        let worker = registry.get(worker.id).unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.load.current_batches, 1);
        assert_eq!(worker.load.memory_mb, 1024);
    }

    #[test]
    fn test_stale_workers_go_offline_and_return_on_heartbeat() {
        let registry = registry();
        let worker = registry
            .register(registration("w", WorkerType::Default, 4096))
            .unwrap();

        let later = Utc::now() + Duration::seconds(300);
        assert_eq!(registry.sweep_stale(later).unwrap(), vec![worker.id]);
        assert_eq!(registry.get(worker.id).unwrap().status, WorkerStatus::Offline);
        assert!(registry
            .find_worker(&item(WorkerType::Default, 1), Utc::now())
            .unwrap()
            .is_none());

        let worker = registry.heartbeat(worker.id, WorkerHealth::Healthy).unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[test]
    fn test_drained_worker_takes_no_work() {
        let registry = registry();
        let worker = registry
            .register(registration("w", WorkerType::Default, 4096))
            .unwrap();
        registry.drain(worker.id).unwrap();
        assert!(registry
            .find_worker(&item(WorkerType::Default, 1), Utc::now())
            .unwrap()
            .is_none());
        assert!(matches!(
            registry.drain(Uuid::new_v4()),
            Err(Error::NotFound { .. })
        ));
    }
}
