//! Worker tier classification for batches
//!
//! Classifies a batch by total size into the worker type it needs and
//! estimates the resources it will hold while running.

use crate::config::WorkerConfig;
use crate::types::{ResourceRequirements, WorkerType};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Size-based tiering of batches onto worker types
#[derive(Debug, Clone)]
pub struct WorkerTier {
    fast_threshold: u64,
    heavy_threshold: u64,
    base_memory_mb: u64,
    max_memory_mb: u64,
}

impl WorkerTier {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            fast_threshold: config.fast_threshold,
            heavy_threshold: config.heavy_threshold,
            base_memory_mb: config.base_memory_mb,
            max_memory_mb: config.max_memory_mb,
        }
    }

    /// Worker type a batch of `total_bytes` needs
    pub fn classify(&self, total_bytes: u64) -> WorkerType {
        if total_bytes < self.fast_threshold {
            WorkerType::Fast
        } else if total_bytes >= self.heavy_threshold {
            WorkerType::Heavy
        } else {
            WorkerType::Default
        }
    }

    /// Resource estimate derived from batch size
    pub fn estimate(&self, total_bytes: u64) -> ResourceRequirements {
        let total_mb = total_bytes / MB;

        let memory_mb = (self.base_memory_mb + total_mb / 4).min(self.max_memory_mb);
        // One core per started GiB
        let cpu_cores = total_bytes.div_ceil(GB).clamp(1, 4) as u32;
        let disk_mb = (2 * total_mb).max(1);

        ResourceRequirements {
            memory_mb,
            cpu_cores,
            disk_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier() -> WorkerTier {
        WorkerTier::new(&WorkerConfig::default())
    }

    #[test]
    fn test_classification_boundaries() {
        let tier = tier();
        assert_eq!(tier.classify(0), WorkerType::Fast);
        assert_eq!(tier.classify(10 * MB - 1), WorkerType::Fast);
        assert_eq!(tier.classify(10 * MB), WorkerType::Default);
        assert_eq!(tier.classify(GB - 1), WorkerType::Default);
        assert_eq!(tier.classify(GB), WorkerType::Heavy);
    }

    #[test]
    fn test_estimates() {
        let tier = tier();

        let small = tier.estimate(100 * 1024);
        assert_eq!(small.memory_mb, 256);
        assert_eq!(small.cpu_cores, 1);
        assert_eq!(small.disk_mb, 1);

        let medium = tier.estimate(400 * MB);
        assert_eq!(medium.memory_mb, 256 + 100);
        assert_eq!(medium.cpu_cores, 1);
        assert_eq!(medium.disk_mb, 800);

        let huge = tier.estimate(100 * GB);
        assert_eq!(huge.memory_mb, 8192);
        assert_eq!(huge.cpu_cores, 4);

        let just_over = tier.estimate(GB + 1);
        assert_eq!(just_over.cpu_cores, 2);
    }
}
