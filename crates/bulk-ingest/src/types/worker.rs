//! Worker types for the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db_enum;
use super::queue::ResourceRequirements;

db_enum! {
    /// Worker specialisation, also the type a queue item asks for
    pub enum WorkerType {
        Default => "default",
        Heavy => "heavy",
        Fast => "fast",
        Specialized => "specialized",
    }
}

impl WorkerType {
    /// Whether a worker of this type may run an item asking for `required`.
    ///
    /// Default workers also take fast and heavy work; specialized work only
    /// runs on specialized workers.
    pub fn serves(&self, required: WorkerType) -> bool {
        *self == required
            || (*self == WorkerType::Default
                && matches!(required, WorkerType::Fast | WorkerType::Heavy))
    }
}

db_enum! {
    pub enum WorkerStatus {
        /// Has headroom for at least one more batch
        Idle => "idle",
        /// At its concurrent batch limit
        Busy => "busy",
        Offline => "offline",
        /// Finishing current work, takes nothing new
        Draining => "draining",
    }
}

db_enum! {
    pub enum WorkerHealth {
        Healthy => "healthy",
        Degraded => "degraded",
        Unhealthy => "unhealthy",
    }
}

/// Static capacity declared at registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCapacity {
    pub max_concurrent_batches: u32,
    pub max_concurrent_files: u32,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    /// Lowercase extensions; empty means every type
    #[serde(default)]
    pub supported_file_types: Vec<String>,
}

/// Resources currently held by assigned items
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WorkerLoad {
    pub current_batches: u32,
    pub memory_mb: u64,
    pub cpu_cores: u32,
}

/// A processing agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    pub health: WorkerHealth,
    pub capacity: WorkerCapacity,
    pub load: WorkerLoad,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn spare_memory_mb(&self) -> u64 {
        self.capacity.memory_mb.saturating_sub(self.load.memory_mb)
    }

    pub fn spare_cpu_cores(&self) -> u32 {
        self.capacity.cpu_cores.saturating_sub(self.load.cpu_cores)
    }

    pub fn spare_batches(&self) -> u32 {
        self.capacity
            .max_concurrent_batches
            .saturating_sub(self.load.current_batches)
    }

    /// Enough memory, CPU and batch slots left for `req`
    pub fn has_headroom(&self, req: &ResourceRequirements) -> bool {
        self.spare_batches() > 0
            && self.spare_memory_mb() >= req.memory_mb
            && self.spare_cpu_cores() >= req.cpu_cores
    }

    /// Handles every extension in `file_types`
    pub fn supports(&self, file_types: &[String]) -> bool {
        let supported = &self.capacity.supported_file_types;
        supported.is_empty() || file_types.iter().all(|t| supported.contains(t))
    }

    /// Status implied by the current load
    pub fn status_for_load(&self) -> WorkerStatus {
        match self.status {
            WorkerStatus::Offline | WorkerStatus::Draining => self.status,
            _ if self.spare_batches() == 0 => WorkerStatus::Busy,
            _ => WorkerStatus::Idle,
        }
    }
}

/// Registration request sent by a worker on startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: String,
    pub worker_type: WorkerType,
    pub capacity: WorkerCapacity,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(memory_mb: u64, batches: u32) -> Worker {
        let now = Utc::now();
        Worker {
            id: Uuid::new_v4(),
            name: "w".to_string(),
            worker_type: WorkerType::Default,
            status: WorkerStatus::Idle,
            health: WorkerHealth::Healthy,
            capacity: WorkerCapacity {
                max_concurrent_batches: batches,
                max_concurrent_files: 4,
                memory_mb,
                cpu_cores: 4,
                supported_file_types: vec![],
            },
            load: WorkerLoad::default(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    #[test]
    fn test_type_serving_rules() {
        assert!(WorkerType::Default.serves(WorkerType::Fast));
        assert!(WorkerType::Default.serves(WorkerType::Heavy));
        assert!(!WorkerType::Default.serves(WorkerType::Specialized));
        assert!(!WorkerType::Fast.serves(WorkerType::Heavy));
        assert!(WorkerType::Specialized.serves(WorkerType::Specialized));
    }

    #[test]
    fn test_headroom() {
        let mut w = worker(1024, 1);
        let req = ResourceRequirements {
            memory_mb: 512,
            cpu_cores: 1,
            disk_mb: 10,
        };
        assert!(w.has_headroom(&req));
        w.load.current_batches = 1;
        assert!(!w.has_headroom(&req));
        assert_eq!(w.status_for_load(), WorkerStatus::Busy);
    }

    #[test]
    fn test_supported_types() {
        let mut w = worker(1024, 1);
        assert!(w.supports(&["pdf".to_string()]));
        w.capacity.supported_file_types = vec!["pdf".to_string()];
        assert!(w.supports(&["pdf".to_string()]));
        assert!(!w.supports(&["pdf".to_string(), "png".to_string()]));
    }
}
