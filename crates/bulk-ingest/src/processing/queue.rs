//! Priority queue manager
//!
//! Items are ordered by `(priority, position)`; positions are recomputed on
//! every membership change. Every status change is a guarded update, so a
//! lost race shows up as [`Error::Conflict`] instead of a double assignment.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::events::EventLogger;
use crate::storage::IngestDb;
use crate::types::{DbEnum, FailureOutcome, NewQueueItem, QueueItem, QueueItemStatus, QueueStats};

/// Queue of batch work items
pub struct QueueManager {
    db: IngestDb,
    config: QueueConfig,
    events: Arc<dyn EventLogger>,
    notify: Arc<Notify>,
}

impl QueueManager {
    pub fn new(db: IngestDb, config: QueueConfig, events: Arc<dyn EventLogger>) -> Self {
        Self {
            db,
            config,
            events,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever new work may have become ready
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add an item for a batch
    pub fn enqueue(&self, request: NewQueueItem) -> Result<QueueItem> {
        if !(1..=10).contains(&request.priority) {
            return Err(Error::validation(format!(
                "Priority must be between 1 and 10, got {}",
                request.priority
            )));
        }
        for dependency in &request.dependencies {
            if *dependency == request.batch_id {
                return Err(Error::validation("A batch cannot depend on itself"));
            }
            let known = self
                .db
                .get_batch(*dependency)?
                .filter(|b| b.tenant_id == request.tenant_id && b.deleted_at.is_none());
            if known.is_none() {
                return Err(Error::validation(format!(
                    "Dependency batch {} does not exist",
                    dependency
                )));
            }
        }

        let now = Utc::now();
        let scheduled_at = request.scheduled_at.unwrap_or(now);
        let mut dependencies = request.dependencies;
        dependencies.sort();
        dependencies.dedup();

        let item = QueueItem {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            batch_id: request.batch_id,
            queue_type: request.queue_type,
            priority: request.priority,
            position: 0,
            status: QueueItemStatus::Queued,
            worker_type: request.worker_type,
            required_file_types: request.required_file_types,
            assigned_worker: None,
            resources: request.resources,
            dependencies,
            retry_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at: None,
            scheduled_at,
            expires_at: Some(scheduled_at + secs(self.config.item_ttl_secs)),
            max_processing_secs: self.config.max_processing_secs,
            started_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_queue_item(&item)?;
        self.db.recompute_queue_positions()?;

        self.events.info(
            Some(item.tenant_id),
            "queue.enqueued",
            &format!(
                "Batch {} queued with priority {} for a {} worker",
                item.batch_id, item.priority, item.worker_type
            ),
            json!({
                "item_id": item.id,
                "batch_id": item.batch_id,
                "priority": item.priority,
                "worker_type": item.worker_type,
                "dependencies": item.dependencies,
                "memory_mb": item.resources.memory_mb,
            }),
        );
        self.wake();

        self.get(item.id)
    }

    pub fn get(&self, item_id: Uuid) -> Result<QueueItem> {
        self.db
            .get_queue_item(item_id)?
            .ok_or_else(|| Error::not_found("queue item", item_id))
    }

    /// Most recent item created for a batch
    pub fn item_for_batch(&self, batch_id: Uuid) -> Result<Option<QueueItem>> {
        self.db.latest_queue_item_for_batch(batch_id)
    }

    /// Items currently held by a worker
    pub fn assigned_to(&self, worker_id: Uuid) -> Result<Vec<QueueItem>> {
        self.db.list_assigned_items(worker_id)
    }

    /// Highest-priority item that may run now
    pub fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        Ok(self.db.ready_queue_items(now, 1)?.into_iter().next())
    }

    /// Up to `limit` ready items, best first
    pub fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        self.db.ready_queue_items(now, limit)
    }

    /// `queued -> running` for `worker_id`; a lost race is a conflict
    pub fn assign(&self, item_id: Uuid, worker_id: Uuid) -> Result<QueueItem> {
        if !self.db.assign_queue_item(item_id, worker_id, Utc::now())? {
            return Err(Error::Conflict(format!(
                "Queue item {} is no longer queued",
                item_id
            )));
        }
        self.db.recompute_queue_positions()?;

        let item = self.get(item_id)?;
        self.events.info(
            Some(item.tenant_id),
            "queue.assigned",
            &format!("Batch {} assigned to worker {}", item.batch_id, worker_id),
            json!({ "item_id": item.id, "batch_id": item.batch_id, "worker_id": worker_id }),
        );
        Ok(item)
    }

    /// `running -> completed` by the worker holding the item
    pub fn complete(&self, item_id: Uuid, worker_id: Uuid) -> Result<QueueItem> {
        if !self.db.complete_queue_item(item_id, worker_id, Utc::now())? {
            return Err(Error::Conflict(format!(
                "Queue item {} is not running on worker {}",
                item_id, worker_id
            )));
        }
        let item = self.get(item_id)?;
        self.events.info(
            Some(item.tenant_id),
            "queue.completed",
            &format!("Queue item for batch {} completed", item.batch_id),
            json!({ "item_id": item.id, "batch_id": item.batch_id, "worker_id": worker_id }),
        );
        self.wake();
        Ok(item)
    }

    /// Fail a running item: requeue with backoff or fail terminally
    pub fn fail(&self, item_id: Uuid, error: &str) -> Result<FailureOutcome> {
        self.fail_at(item_id, error, Utc::now())
    }

    pub fn fail_at(&self, item_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<FailureOutcome> {
        let item = self.get(item_id)?;
        if item.status != QueueItemStatus::Running {
            return Err(Error::invalid_state(format!(
                "Queue item {} is {}, only running items can fail",
                item_id, item.status
            )));
        }

        let outcome = if item.retry_count < item.max_retries {
            let next_retry_at = now + self.backoff(item.retry_count);
            if !self
                .db
                .requeue_queue_item(item_id, item.retry_count, next_retry_at, error, now)?
            {
                return Err(Error::Conflict(format!("Queue item {} changed while failing", item_id)));
            }
            self.db.recompute_queue_positions()?;
            FailureOutcome::Requeued {
                retry_count: item.retry_count + 1,
                next_retry_at,
            }
        } else {
            if !self.db.fail_queue_item(item_id, item.retry_count, error, now)? {
                return Err(Error::Conflict(format!("Queue item {} changed while failing", item_id)));
            }
            FailureOutcome::Failed {
                retry_count: item.retry_count,
            }
        };

        match outcome {
            FailureOutcome::Requeued { retry_count, next_retry_at } => self.events.warn(
                Some(item.tenant_id),
                "queue.retry_scheduled",
                &format!(
                    "Batch {} failed (attempt {}), retrying at {}: {}",
                    item.batch_id, retry_count, next_retry_at, error
                ),
                json!({ "item_id": item.id, "retry_count": retry_count, "error": error }),
            ),
            FailureOutcome::Failed { retry_count } => self.events.error(
                Some(item.tenant_id),
                "queue.failed",
                &format!(
                    "Batch {} failed after {} retries: {}",
                    item.batch_id, retry_count, error
                ),
                json!({ "item_id": item.id, "retry_count": retry_count, "error": error }),
            ),
        }
        self.wake();
        Ok(outcome)
    }

    /// Cancel a live item; returns it as it was before cancellation
    pub fn cancel(&self, item_id: Uuid, reason: &str) -> Result<Option<QueueItem>> {
        let item = self.get(item_id)?;
        let cancelled = self.db.transition_queue_item(
            item_id,
            &[QueueItemStatus::Queued, QueueItemStatus::Running, QueueItemStatus::Paused],
            QueueItemStatus::Cancelled,
            Some(reason),
            Utc::now(),
        )?;
        if !cancelled {
            return Ok(None);
        }
        self.db.recompute_queue_positions()?;
        self.events.info(
            Some(item.tenant_id),
            "queue.cancelled",
            &format!("Queue item for batch {} cancelled: {}", item.batch_id, reason),
            json!({ "item_id": item.id, "batch_id": item.batch_id }),
        );
        Ok(Some(item))
    }

    /// Cancel the live item of a batch, if any
    pub fn cancel_for_batch(&self, batch_id: Uuid, reason: &str) -> Result<Option<QueueItem>> {
        match self.item_for_batch(batch_id)? {
            Some(item) if !item.status.is_terminal() => self.cancel(item.id, reason),
            _ => Ok(None),
        }
    }

    pub fn pause(&self, item_id: Uuid) -> Result<()> {
        self.guarded(item_id, QueueItemStatus::Queued, QueueItemStatus::Paused)?;
        self.db.recompute_queue_positions()?;
        Ok(())
    }

    pub fn resume(&self, item_id: Uuid) -> Result<()> {
        self.guarded(item_id, QueueItemStatus::Paused, QueueItemStatus::Queued)?;
        self.db.recompute_queue_positions()?;
        self.wake();
        Ok(())
    }

    /// Put running items past their max processing time back in the queue.
    ///
    /// Returns the reaped items as they were, so the caller can release the
    /// capacity their workers held.
    pub fn reap_stuck(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let mut reaped = Vec::new();

        for item in self.db.list_queue_items(QueueItemStatus::Running)? {
            let Some(started_at) = item.started_at else {
                continue;
            };
            if now - started_at <= secs(item.max_processing_secs) {
                continue;
            }

            let message = format!(
                "Exceeded max processing time of {}s on worker {:?}",
                item.max_processing_secs, item.assigned_worker
            );
            let reset = self.db.transition_queue_item(
                item.id,
                &[QueueItemStatus::Running],
                QueueItemStatus::Queued,
                Some(&message),
                now,
            )?;
            if reset {
                self.events.warn(
                    Some(item.tenant_id),
                    "queue.reaped",
                    &format!("Batch {} reset to queued: {}", item.batch_id, message),
                    json!({ "item_id": item.id, "worker_id": item.assigned_worker }),
                );
                reaped.push(item);
            }
        }

        if !reaped.is_empty() {
            self.db.recompute_queue_positions()?;
            self.wake();
        }
        Ok(reaped)
    }

    /// Expire queued items past their TTL
    pub fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.db.expire_queue_items(now)?;
        for item in &expired {
            self.events.warn(
                Some(item.tenant_id),
                "queue.expired",
                &format!("Queue item for batch {} expired before it could run", item.batch_id),
                json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "from": "queued",
                    "to": "expired",
                }),
            );
        }
        if !expired.is_empty() {
            tracing::info!("Expired {} queue items", expired.len());
            self.db.recompute_queue_positions()?;
        }
        Ok(expired.len())
    }

    /// Delete terminal items older than the retention window
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .db
            .delete_terminal_queue_items(now - Duration::days(self.config.retention_days))?;
        if removed > 0 {
            tracing::info!("Removed {} terminal queue items", removed);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db.queue_stats()
    }

    /// `2^retry_count * base`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1i64 << retry_count.min(20);
        Duration::seconds(self.config.base_retry_delay_secs as i64 * factor)
    }

    fn guarded(&self, item_id: Uuid, from: QueueItemStatus, to: QueueItemStatus) -> Result<()> {
        let item = self.get(item_id)?;
        if !self.db.transition_queue_item(item_id, &[from], to, None, Utc::now())? {
            return Err(Error::invalid_state(format!(
                "Queue item {} is {}, expected {}",
                item_id, item.status, from
            )));
        }
        self.events.info(
            Some(item.tenant_id),
            &format!("queue.{}", to),
            &format!("Queue item for batch {} is now {}", item.batch_id, to),
            json!({
                "item_id": item_id,
                "batch_id": item.batch_id,
                "from": from.as_str(),
                "to": to.as_str(),
            }),
        );
        Ok(())
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventLog;
    use crate::testing;
    use crate::types::{BatchStatus, QueueType, ResourceRequirements, WorkerType};

    fn manager(db: &IngestDb) -> QueueManager {
        QueueManager::new(db.clone(), QueueConfig::default(), Arc::new(TracingEventLog))
    }

    fn request(tenant_id: Uuid, priority: u8) -> NewQueueItem {
        NewQueueItem {
            tenant_id,
            batch_id: Uuid::new_v4(),
            queue_type: QueueType::Processing,
            priority,
            worker_type: WorkerType::Default,
            required_file_types: vec!["pdf".to_string()],
            resources: ResourceRequirements {
                memory_mb: 256,
                cpu_cores: 1,
                disk_mb: 1,
            },
            dependencies: vec![],
            scheduled_at: None,
        }
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let tenant = Uuid::new_v4();

        let low = queue.enqueue(request(tenant, 7)).unwrap();
        let high_first = queue.enqueue(request(tenant, 2)).unwrap();
        let high_second = queue.enqueue(request(tenant, 2)).unwrap();

        let ready: Vec<Uuid> = queue.ready(Utc::now(), 10).unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![high_first.id, high_second.id, low.id]);
        assert_eq!(queue.get(low.id).unwrap().position, 3);
        assert_eq!(queue.get(high_first.id).unwrap().position, 1);
    }

    #[test]
    fn test_invalid_priority_and_unknown_dependency_rejected() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let tenant = Uuid::new_v4();

        assert!(matches!(queue.enqueue(request(tenant, 0)), Err(Error::Validation(_))));
        assert!(matches!(queue.enqueue(request(tenant, 11)), Err(Error::Validation(_))));

        let mut req = request(tenant, 5);
        req.dependencies = vec![Uuid::new_v4()];
        assert!(matches!(queue.enqueue(req), Err(Error::Validation(_))));
    }

    #[test]
    fn test_dependency_gates_readiness() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let tenant = Uuid::new_v4();

        let mut dependency = testing::batch(tenant);
        db.insert_batch(&mut dependency).unwrap();

        let mut req = request(tenant, 1);
        req.dependencies = vec![dependency.id];
        let gated = queue.enqueue(req).unwrap();
        let free = queue.enqueue(request(tenant, 9)).unwrap();

        assert_eq!(queue.next_ready(Utc::now()).unwrap().unwrap().id, free.id);

        // Failed dependencies never satisfy the gate
        db.transition_batch(dependency.id, &[BatchStatus::Pending], BatchStatus::Failed, None, Utc::now())
            .unwrap();
        let ready: Vec<Uuid> = queue.ready(Utc::now(), 10).unwrap().iter().map(|i| i.id).collect();
        assert!(!ready.contains(&gated.id));

        db.transition_batch(dependency.id, &[BatchStatus::Failed], BatchStatus::Completed, None, Utc::now())
            .unwrap();
        assert_eq!(queue.next_ready(Utc::now()).unwrap().unwrap().id, gated.id);
    }

    #[test]
    fn test_double_assignment_is_a_conflict() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let item = queue.enqueue(request(Uuid::new_v4(), 5)).unwrap();

        let assigned = queue.assign(item.id, Uuid::new_v4()).unwrap();
        assert_eq!(assigned.status, QueueItemStatus::Running);
        assert!(matches!(queue.assign(item.id, Uuid::new_v4()), Err(Error::Conflict(_))));
        assert!(queue.next_ready(Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_backoff_and_retry_budget() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let worker = Uuid::new_v4();
        let item = queue.enqueue(request(Uuid::new_v4(), 5)).unwrap();
        let now = Utc::now();

        let mut last_retry = 0;
        for attempt in 0..3u32 {
            queue.assign(item.id, worker).unwrap();
            match queue.fail_at(item.id, "worker crashed", now).unwrap() {
                FailureOutcome::Requeued { retry_count, next_retry_at } => {
                    assert_eq!(retry_count, attempt + 1);
                    assert!(retry_count > last_retry);
                    last_retry = retry_count;
                    assert_eq!(next_retry_at, now + Duration::seconds(30 * (1 << attempt)));
                }
                other => panic!("expected requeue, got {:?}", other),
            }
            // Not ready until the backoff passes
            assert!(queue.next_ready(now).unwrap().is_none());
            assert!(queue
                .next_ready(now + Duration::seconds(30 * (1 << attempt) + 1))
                .unwrap()
                .is_some());
        }

        queue.assign(item.id, worker).unwrap();
        assert_eq!(
            queue.fail_at(item.id, "worker crashed", now).unwrap(),
            FailureOutcome::Failed { retry_count: 3 }
        );
        let item = queue.get(item.id).unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);
        assert_eq!(item.retry_count, 3);
    }

    #[test]
    fn test_reaper_resets_stuck_items() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let worker = Uuid::new_v4();
        let item = queue.enqueue(request(Uuid::new_v4(), 5)).unwrap();
        queue.assign(item.id, worker).unwrap();

        assert!(queue.reap_stuck(Utc::now()).unwrap().is_empty());

        let late = Utc::now() + Duration::seconds(3601);
        let reaped = queue.reap_stuck(late).unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].assigned_worker, Some(worker));

        let item = queue.get(item.id).unwrap();
        assert_eq!(item.status, QueueItemStatus::Queued);
        assert!(item.assigned_worker.is_none());
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn test_pause_resume_cancel_and_expire() {
        let db = IngestDb::in_memory().unwrap();
        let queue = manager(&db);
        let item = queue.enqueue(request(Uuid::new_v4(), 5)).unwrap();

        queue.pause(item.id).unwrap();
        assert!(queue.next_ready(Utc::now()).unwrap().is_none());
        assert!(matches!(queue.pause(item.id), Err(Error::InvalidState(_))));
        queue.resume(item.id).unwrap();
        assert!(queue.next_ready(Utc::now()).unwrap().is_some());

        let expiring = queue.enqueue(request(Uuid::new_v4(), 5)).unwrap();
        assert_eq!(queue.expire(Utc::now() + Duration::hours(25)).unwrap(), 2);
        assert_eq!(queue.get(expiring.id).unwrap().status, QueueItemStatus::Expired);

        let other = queue.enqueue(request(Uuid::new_v4(), 5)).unwrap();
        assert!(queue.cancel(other.id, "batch cancelled").unwrap().is_some());
        assert!(queue.cancel(other.id, "batch cancelled").unwrap().is_none());

        let stats = queue.stats().unwrap();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(queue.cleanup(Utc::now() + Duration::days(9)).unwrap(), 3);
    }

    #[test]
    fn test_pause_resume_and_expiry_are_logged() {
        let db = IngestDb::in_memory().unwrap();
        let queue = QueueManager::new(
            db.clone(),
            QueueConfig::default(),
            Arc::new(crate::events::DbEventLog::new(db.clone())),
        );
        let tenant = Uuid::new_v4();
        let item = queue.enqueue(request(tenant, 5)).unwrap();

        queue.pause(item.id).unwrap();
        queue.resume(item.id).unwrap();
        assert_eq!(queue.expire(Utc::now() + Duration::hours(25)).unwrap(), 1);

        let events = db.list_events(tenant, 20).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"queue.paused"));
        assert!(types.contains(&"queue.queued"));
        assert!(types.contains(&"queue.expired"));

        let expired = events.iter().find(|e| e.event_type == "queue.expired").unwrap();
        assert_eq!(expired.data["item_id"], json!(item.id));
        assert_eq!(expired.data["to"], json!("expired"));
    }
}
