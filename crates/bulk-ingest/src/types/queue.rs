//! Queue item types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db_enum;
use super::worker::WorkerType;

db_enum! {
    pub enum QueueType {
        Upload => "upload",
        Processing => "processing",
        Retry => "retry",
        Cleanup => "cleanup",
    }
}

db_enum! {
    pub enum QueueItemStatus {
        Queued => "queued",
        Running => "running",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        Expired => "expired",
    }
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Completed
                | QueueItemStatus::Failed
                | QueueItemStatus::Cancelled
                | QueueItemStatus::Expired
        )
    }
}

/// Resources a queue item needs from its worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceRequirements {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub disk_mb: u64,
}

/// Schedulable unit of work tied to a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub batch_id: Uuid,
    pub queue_type: QueueType,
    /// 1 highest .. 10 lowest
    pub priority: u8,
    /// 1-based rank among queued items, recomputed on membership change
    pub position: u32,
    pub status: QueueItemStatus,
    pub worker_type: WorkerType,
    /// Extensions present in the batch
    pub required_file_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<Uuid>,
    pub resources: ResourceRequirements,
    /// Batches that must complete before this item may run
    pub dependencies: Vec<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Not eligible before this instant
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub max_processing_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Enqueue request
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub tenant_id: Uuid,
    pub batch_id: Uuid,
    pub queue_type: QueueType,
    pub priority: u8,
    pub worker_type: WorkerType,
    pub required_file_types: Vec<String>,
    pub resources: ResourceRequirements,
    pub dependencies: Vec<Uuid>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Result of failing a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back in the queue after a backoff delay
    Requeued {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted
    Failed { retry_count: u32 },
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub expired: usize,
}
