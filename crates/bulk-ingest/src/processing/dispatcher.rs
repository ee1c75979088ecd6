//! Queue dispatcher
//!
//! Wakes on queue notifications (or the poll interval), runs maintenance and
//! hands ready items to capable workers. Assignment is a reserve-then-assign
//! sequence of guarded updates, so several dispatchers may run against the
//! same database without double-booking an item or a worker.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{QueueItem, WorkerStatus};

use super::queue::QueueManager;
use super::registry::WorkerRegistry;

/// Ready items inspected per dispatch pass
const DISPATCH_BATCH: usize = 64;

/// Work handed to a local worker
#[derive(Debug, Clone)]
pub struct Assignment {
    pub item: QueueItem,
    pub worker_id: Uuid,
}

/// What one dispatch pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub reaped: usize,
    pub expired: usize,
    pub workers_offline: usize,
    pub assigned: usize,
    /// Ready items no worker could take
    pub unplaced: usize,
}

/// Matches ready queue items to workers
pub struct Dispatcher {
    queue: Arc<QueueManager>,
    registry: Arc<WorkerRegistry>,
    local: DashMap<Uuid, mpsc::Sender<Assignment>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<QueueManager>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            queue,
            registry,
            local: DashMap::new(),
        }
    }

    /// Route assignments for `worker_id` to an in-process channel.
    ///
    /// Workers without a channel are remote and poll their assignments.
    pub fn attach(&self, worker_id: Uuid, sender: mpsc::Sender<Assignment>) {
        self.local.insert(worker_id, sender);
        self.queue.wake();
    }

    pub fn detach(&self, worker_id: Uuid) {
        self.local.remove(&worker_id);
    }

    /// One maintenance and assignment pass
    pub fn dispatch_once(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        let offline = self.registry.sweep_stale(now)?;
        report.workers_offline = offline.len();

        for item in self.queue.reap_stuck(now)? {
            report.reaped += 1;
            if let Some(worker_id) = item.assigned_worker {
                self.release_if_offline(worker_id, &item)?;
            }
        }
        report.expired = self.queue.expire(now)?;

        for item in self.queue.ready(now, DISPATCH_BATCH)? {
            if self.place(&item, now)? {
                report.assigned += 1;
            } else {
                report.unplaced += 1;
            }
        }

        if report.assigned > 0 || report.reaped > 0 || report.expired > 0 {
            tracing::debug!(
                "Dispatch pass: {} assigned, {} unplaced, {} reaped, {} expired",
                report.assigned,
                report.unplaced,
                report.reaped,
                report.expired
            );
        }
        Ok(report)
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let notify = self.queue.notifier();
        let poll = Duration::from_millis(self.queue.config().poll_interval_ms.max(10));

        tracing::info!("Dispatcher started, poll interval {}ms", poll.as_millis());

        loop {
            if let Err(e) = self.dispatch_once(Utc::now()) {
                tracing::error!("Dispatch pass failed: {}", e);
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Dispatcher stopped");
    }

    /// Try candidates in order; true when the item was assigned
    fn place(&self, item: &QueueItem, now: DateTime<Utc>) -> Result<bool> {
        for worker in self.registry.candidates_for(item, now)? {
            if !self.registry.reserve(worker.id, &item.resources)? {
                continue;
            }

            let assigned = match self.queue.assign(item.id, worker.id) {
                Ok(assigned) => assigned,
                Err(Error::Conflict(_)) => {
                    // Another dispatcher took the item
                    self.registry.release(worker.id, &item.resources)?;
                    return Ok(false);
                }
                Err(e) => {
                    self.registry.release(worker.id, &item.resources)?;
                    return Err(e);
                }
            };

            self.deliver(assigned, worker.id)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn deliver(&self, item: QueueItem, worker_id: Uuid) -> Result<()> {
        let Some(sender) = self.local.get(&worker_id).map(|s| s.clone()) else {
            return Ok(());
        };

        let item_id = item.id;
        let resources = item.resources;
        if let Err(e) = sender.try_send(Assignment { item, worker_id }) {
            tracing::warn!("Worker {} did not accept item {}: {}", worker_id, item_id, e);
            if matches!(e, mpsc::error::TrySendError::Closed(_)) {
                self.local.remove(&worker_id);
            }
            self.queue.fail(item_id, "worker unavailable")?;
            self.registry.release(worker_id, &resources)?;
        }
        Ok(())
    }

    /// A live worker returns its own capacity when its attempt ends
    fn release_if_offline(&self, worker_id: Uuid, item: &QueueItem) -> Result<()> {
        match self.registry.get(worker_id) {
            Ok(worker) if worker.status == WorkerStatus::Offline => {
                self.registry.release(worker_id, &item.resources)
            }
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
