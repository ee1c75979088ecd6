//! Configuration for the bulk ingest system

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{DbEnum, DetectionAlgorithm};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Main ingest system configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    /// Database and object storage locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Batch capacity defaults (overridable per tenant)
    #[serde(default)]
    pub batch: BatchConfig,
    /// Queue scheduling and retry policy
    #[serde(default)]
    pub queue: QueueConfig,
    /// Worker registry and local worker pool
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Resumable chunked uploads
    #[serde(default)]
    pub uploads: ChunkedUploadConfig,
    /// Duplicate detection
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Rate limiting rules
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl IngestConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: IngestConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<()> {
        let uploads = &self.uploads;
        if uploads.min_chunk_size == 0 || uploads.min_chunk_size > uploads.max_chunk_size {
            return Err(Error::Config(format!(
                "Invalid chunk size bounds: min {} max {}",
                uploads.min_chunk_size, uploads.max_chunk_size
            )));
        }
        if uploads.default_chunk_size < uploads.min_chunk_size
            || uploads.default_chunk_size > uploads.max_chunk_size
        {
            return Err(Error::Config(format!(
                "Default chunk size {} outside [{}, {}]",
                uploads.default_chunk_size, uploads.min_chunk_size, uploads.max_chunk_size
            )));
        }
        if uploads.max_parallel_chunks == 0 {
            return Err(Error::Config("max_parallel_chunks must be at least 1".to_string()));
        }
        if self.batch.max_files_per_batch == 0 || self.batch.max_batch_bytes == 0 {
            return Err(Error::Config("Batch ceilings must be positive".to_string()));
        }
        if self.queue.base_retry_delay_secs == 0 {
            return Err(Error::Config("base_retry_delay_secs must be positive".to_string()));
        }
        if self.workers.fast_threshold >= self.workers.heavy_threshold {
            return Err(Error::Config(
                "fast_threshold must be below heavy_threshold".to_string(),
            ));
        }
        self.dedup.parsed_algorithms()?;
        for (operation, rule) in &self.rate_limit.rules {
            if rule.window_secs == 0 || rule.max_requests == 0 {
                return Err(Error::Config(format!(
                    "Rate limit rule '{}' needs a positive window and limit",
                    operation
                )));
            }
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Root directory for stored objects
    #[serde(default = "default_objects_dir")]
    pub objects_dir: PathBuf,
    /// Root directory for chunk staging
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Event log rows older than this are pruned (default: 90 days)
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,
}

fn default_database_path() -> PathBuf { PathBuf::from("./data/ingest.db") }
fn default_objects_dir() -> PathBuf { PathBuf::from("./data/objects") }
fn default_staging_dir() -> PathBuf { PathBuf::from("./data/staging") }
fn default_event_retention_days() -> i64 { 90 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            objects_dir: default_objects_dir(),
            staging_dir: default_staging_dir(),
            event_retention_days: default_event_retention_days(),
        }
    }
}

/// Batch capacity defaults applied when a tenant has no override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum files in one batch (default: 1000)
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: u32,
    /// Maximum total bytes in one batch (default: 5GB)
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
    /// Maximum size of a single file (default: 2GB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Lowercase extensions accepted without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Non-terminal batches a tenant may hold at once (default: 20)
    #[serde(default = "default_max_active_batches")]
    pub max_active_batches: u32,
    /// Retry hint handed out when the active batch quota is full (default: 60)
    #[serde(default = "default_active_quota_retry_secs")]
    pub active_quota_retry_secs: u64,
    /// Processing attempts per file before it is terminally failed (default: 3)
    #[serde(default = "default_max_file_retries")]
    pub max_file_retries: u32,
    /// Files processed concurrently for parallel batches
    pub parallel_files: Option<usize>,
}

fn default_max_files_per_batch() -> u32 { 1000 }
fn default_max_batch_bytes() -> u64 { 5 * GB }
fn default_max_file_size() -> u64 { 2 * GB }
fn default_max_active_batches() -> u32 { 20 }
fn default_active_quota_retry_secs() -> u64 { 60 }
fn default_max_file_retries() -> u32 { 3 }
fn default_allowed_extensions() -> Vec<String> {
    [
        "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "rtf", "txt", "csv",
        "md", "jpg", "jpeg", "png", "gif", "tif", "tiff", "heic", "webp", "zip",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_files_per_batch: default_max_files_per_batch(),
            max_batch_bytes: default_max_batch_bytes(),
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            max_active_batches: default_max_active_batches(),
            active_quota_retry_secs: default_active_quota_retry_secs(),
            max_file_retries: default_max_file_retries(),
            parallel_files: None, // Auto-detect from CPU count
        }
    }
}

impl BatchConfig {
    /// Files processed at once for parallel batches
    pub fn parallel_files(&self) -> usize {
        self.parallel_files
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Base delay for exponential retry backoff (default: 30s)
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_secs: u64,
    /// Retries before a queue item is terminally failed (default: 3)
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    /// Runtime after which a running item is reaped (default: 3600s)
    #[serde(default = "default_max_processing_secs")]
    pub max_processing_secs: u64,
    /// Queued items older than this expire (default: 24h)
    #[serde(default = "default_item_ttl")]
    pub item_ttl_secs: u64,
    /// Terminal items kept this long before cleanup (default: 7 days)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Fallback dispatcher poll interval (default: 5s)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Default priority for new items, 1 highest .. 10 lowest
    #[serde(default = "default_priority")]
    pub default_priority: u8,
}

fn default_base_retry_delay() -> u64 { 30 }
fn default_queue_max_retries() -> u32 { 3 }
fn default_max_processing_secs() -> u64 { 3600 }
fn default_item_ttl() -> u64 { 24 * 3600 }
fn default_retention_days() -> i64 { 7 }
fn default_poll_interval_ms() -> u64 { 5000 }
fn default_priority() -> u8 { 5 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_secs: default_base_retry_delay(),
            max_retries: default_queue_max_retries(),
            max_processing_secs: default_max_processing_secs(),
            item_ttl_secs: default_item_ttl(),
            retention_days: default_retention_days(),
            poll_interval_ms: default_poll_interval_ms(),
            default_priority: default_priority(),
        }
    }
}

/// Worker registry and local pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers without a heartbeat for this long go offline (default: 90s)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Heartbeat interval for local workers (default: 15s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Local workers started by the daemon (default: 2)
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
    /// Memory budget per local worker in MB (default: 4096)
    #[serde(default = "default_worker_memory")]
    pub worker_memory_mb: u64,
    /// CPU cores per local worker
    pub worker_cpu_cores: Option<u32>,
    /// Concurrent batches per local worker (default: 2)
    #[serde(default = "default_worker_batches")]
    pub worker_max_batches: u32,
    /// Scan and hash time allowed per file (default: 600s)
    #[serde(default = "default_file_timeout")]
    pub file_timeout_secs: u64,

    // Tier thresholds (bytes), same scheme as size-based file tiers
    /// Batches smaller than this go to fast workers (default: 10MB)
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u64,
    /// Batches at least this large go to heavy workers (default: 1GB)
    #[serde(default = "default_heavy_threshold")]
    pub heavy_threshold: u64,

    // Resource estimation
    /// Baseline memory requirement per batch in MB (default: 256)
    #[serde(default = "default_base_memory")]
    pub base_memory_mb: u64,
    /// Cap on estimated memory per batch in MB (default: 8192)
    #[serde(default = "default_max_memory")]
    pub max_memory_mb: u64,
}

fn default_heartbeat_timeout() -> u64 { 90 }
fn default_heartbeat_interval() -> u64 { 15 }
fn default_local_workers() -> usize { 2 }
fn default_worker_memory() -> u64 { 4096 }
fn default_worker_batches() -> u32 { 2 }
fn default_file_timeout() -> u64 { 600 }
fn default_fast_threshold() -> u64 { 10 * MB }
fn default_heavy_threshold() -> u64 { GB }
fn default_base_memory() -> u64 { 256 }
fn default_max_memory() -> u64 { 8192 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            local_workers: default_local_workers(),
            worker_memory_mb: default_worker_memory(),
            worker_cpu_cores: None, // Auto-detect from CPU count
            worker_max_batches: default_worker_batches(),
            file_timeout_secs: default_file_timeout(),
            fast_threshold: default_fast_threshold(),
            heavy_threshold: default_heavy_threshold(),
            base_memory_mb: default_base_memory(),
            max_memory_mb: default_max_memory(),
        }
    }
}

impl WorkerConfig {
    pub fn worker_cpu_cores(&self) -> u32 {
        self.worker_cpu_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1)
    }
}

/// Chunked upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedUploadConfig {
    /// Chunk size used when the client does not ask for one (default: 5MB)
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// Smallest accepted chunk size (default: 256KB)
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// Largest accepted chunk size (default: 100MB)
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Largest file accepted through a session (default: 10GB)
    #[serde(default = "default_max_upload_size")]
    pub max_file_size: u64,
    /// Session lifetime (default: 24h)
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Chunks of one session written concurrently (default: 4)
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
    /// Attempts per chunk before manual resubmission is needed (default: 3)
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    /// Base of the chunk retry backoff hint (default: 500ms)
    #[serde(default = "default_chunk_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Verify the assembled file against the declared hash (default: true)
    #[serde(default = "default_true")]
    pub verify_assembled_hash: bool,
}

fn default_chunk_size() -> u64 { 5 * MB }
fn default_min_chunk_size() -> u64 { 256 * 1024 }
fn default_max_chunk_size() -> u64 { 100 * MB }
fn default_max_upload_size() -> u64 { 10 * GB }
fn default_session_ttl() -> u64 { 24 * 3600 }
fn default_max_parallel_chunks() -> usize { 4 }
fn default_max_chunk_retries() -> u32 { 3 }
fn default_chunk_retry_base_ms() -> u64 { 500 }
fn default_true() -> bool { true }

impl Default for ChunkedUploadConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_file_size: default_max_upload_size(),
            session_ttl_secs: default_session_ttl(),
            max_parallel_chunks: default_max_parallel_chunks(),
            max_chunk_retries: default_max_chunk_retries(),
            retry_base_ms: default_chunk_retry_base_ms(),
            verify_assembled_hash: true,
        }
    }
}

/// Score thresholds for one similarity algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceThresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl ConfidenceThresholds {
    pub const fn new(high: f64, medium: f64, low: f64) -> Self {
        Self { high, medium, low }
    }
}

/// Duplicate detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Algorithms run by default, by name
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,
    #[serde(default = "default_perceptual_thresholds")]
    pub perceptual: ConfidenceThresholds,
    #[serde(default = "default_text_thresholds")]
    pub text: ConfidenceThresholds,
    #[serde(default = "default_metadata_thresholds")]
    pub metadata: ConfidenceThresholds,
    #[serde(default = "default_fuzzy_thresholds")]
    pub fuzzy_filename: ConfidenceThresholds,
    /// Smaller/larger size ratio required before non-hash comparison (default: 0.5)
    #[serde(default = "default_min_size_ratio")]
    pub min_size_ratio: f64,
    /// Characters of extracted text compared (default: 20000)
    #[serde(default = "default_text_max_chars")]
    pub text_max_chars: usize,
    /// Files considered by one session (default: 2000)
    #[serde(default = "default_max_files_per_session")]
    pub max_files_per_session: usize,
    /// Only hash matches are auto-resolvable (default: true)
    #[serde(default = "default_true")]
    pub auto_resolve_hash_only: bool,
    /// Quality scores closer than this make master selection ambiguous (default: 0.05)
    #[serde(default = "default_quality_epsilon")]
    pub ambiguity_epsilon: f64,
    /// Run detection automatically when a batch completes (default: true)
    #[serde(default = "default_true")]
    pub detect_on_batch_complete: bool,
}

fn default_algorithms() -> Vec<String> {
    ["content_hash", "perceptual", "text", "metadata", "fuzzy_filename"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_perceptual_thresholds() -> ConfidenceThresholds { ConfidenceThresholds::new(0.95, 0.90, 0.85) }
fn default_text_thresholds() -> ConfidenceThresholds { ConfidenceThresholds::new(0.95, 0.85, 0.75) }
fn default_metadata_thresholds() -> ConfidenceThresholds { ConfidenceThresholds::new(0.90, 0.75, 0.60) }
fn default_fuzzy_thresholds() -> ConfidenceThresholds { ConfidenceThresholds::new(0.95, 0.85, 0.75) }
fn default_min_size_ratio() -> f64 { 0.5 }
fn default_text_max_chars() -> usize { 20_000 }
fn default_max_files_per_session() -> usize { 2000 }
fn default_quality_epsilon() -> f64 { 0.05 }

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            algorithms: default_algorithms(),
            perceptual: default_perceptual_thresholds(),
            text: default_text_thresholds(),
            metadata: default_metadata_thresholds(),
            fuzzy_filename: default_fuzzy_thresholds(),
            min_size_ratio: default_min_size_ratio(),
            text_max_chars: default_text_max_chars(),
            max_files_per_session: default_max_files_per_session(),
            auto_resolve_hash_only: true,
            ambiguity_epsilon: default_quality_epsilon(),
            detect_on_batch_complete: true,
        }
    }
}

impl DedupConfig {
    /// Configured algorithm names, in tie-break priority order
    pub fn parsed_algorithms(&self) -> Result<Vec<DetectionAlgorithm>> {
        let mut algorithms = Vec::with_capacity(self.algorithms.len());
        for name in &self.algorithms {
            let algorithm = DetectionAlgorithm::from_db(name.trim())
                .ok_or_else(|| Error::Config(format!("Unknown detection algorithm '{}'", name)))?;
            if !algorithms.contains(&algorithm) {
                algorithms.push(algorithm);
            }
        }
        if algorithms.is_empty() {
            return Err(Error::Config("At least one detection algorithm is required".to_string()));
        }
        algorithms.sort_by_key(|a| a.priority());
        Ok(algorithms)
    }

    pub fn thresholds(&self, algorithm: DetectionAlgorithm) -> ConfidenceThresholds {
        match algorithm {
            DetectionAlgorithm::ContentHash => ConfidenceThresholds::new(1.0, 1.0, 1.0),
            DetectionAlgorithm::Perceptual => self.perceptual,
            DetectionAlgorithm::Text => self.text,
            DetectionAlgorithm::Metadata => self.metadata,
            DetectionAlgorithm::FuzzyFilename => self.fuzzy_filename,
        }
    }
}

/// One sliding-window rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Main window length
    pub window_secs: u64,
    /// Requests admitted per main window
    pub max_requests: u32,
    /// Requests admitted per 60-second burst window
    #[serde(default)]
    pub burst_limit: Option<u32>,
}

impl RateLimitRule {
    pub const fn new(window_secs: u64, max_requests: u32, burst_limit: Option<u32>) -> Self {
        Self {
            window_secs,
            max_requests,
            burst_limit,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable admission control (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default rules by operation name
    #[serde(default = "default_rate_rules")]
    pub rules: HashMap<String, RateLimitRule>,
}

fn default_rate_rules() -> HashMap<String, RateLimitRule> {
    HashMap::from([
        ("create_batch".to_string(), RateLimitRule::new(3600, 10, None)),
        ("add_files".to_string(), RateLimitRule::new(3600, 200, Some(50))),
        ("upload_file".to_string(), RateLimitRule::new(3600, 1000, Some(100))),
        ("chunk_upload".to_string(), RateLimitRule::new(3600, 20_000, Some(1000))),
        ("start_detection".to_string(), RateLimitRule::new(3600, 20, Some(5))),
    ])
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: default_rate_rules(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.rules["create_batch"].max_requests, 10);
        assert_eq!(config.rate_limit.rules["create_batch"].window_secs, 3600);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [uploads]
            default_chunk_size = 1048576
            max_parallel_chunks = 8

            [rate_limit.rules.create_batch]
            window_secs = 60
            max_requests = 2
        "#;
        let config: IngestConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.uploads.default_chunk_size, 1024 * 1024);
        assert_eq!(config.uploads.max_parallel_chunks, 8);
        assert_eq!(config.uploads.max_chunk_retries, 3);
        assert_eq!(config.batch.max_files_per_batch, 1000);
        assert_eq!(config.rate_limit.rules["create_batch"].max_requests, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_chunk_bounds_rejected() {
        let mut config = IngestConfig::default();
        config.uploads.min_chunk_size = config.uploads.max_chunk_size + 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
