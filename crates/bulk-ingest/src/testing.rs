//! Shared fixtures for unit tests

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::events::{EventLogger, TracingEventLog};
use crate::storage::IngestDb;
use crate::types::{
    Batch, BatchFile, BatchLimits, BatchStatus, ConcurrencyMode, DuplicatePolicy, ProcessingStatus,
    ScanStatus, UploadStatus, ValidationStatus,
};

/// A pending batch with small limits, not yet stored
pub fn batch(tenant_id: Uuid) -> Batch {
    let now = Utc::now();
    Batch {
        id: Uuid::new_v4(),
        tenant_id,
        name: "fixture".to_string(),
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
            max_total_bytes: 100 * 1024 * 1024,
            max_file_size: 50 * 1024 * 1024,
            allowed_extensions: vec!["pdf".to_string(), "txt".to_string()],
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

/// A file row of `batch_id`, not yet stored
pub fn file(batch_id: Uuid, name: &str, size: u64) -> BatchFile {
    let now = Utc::now();
    BatchFile {
        id: Uuid::new_v4(),
        batch_id,
        tenant_id: Uuid::nil(),
        original_filename: name.to_string(),
        sanitized_filename: name.to_string(),
        extension: crate::batch::extension_of(name),
        size_bytes: size,
        content_type: "application/octet-stream".to_string(),
        content_hash: None,
        declared_hash: None,
        is_duplicate: false,
        duplicate_of: None,
        processing_order: 1,
        priority: 5,
        upload_status: UploadStatus::Pending,
        processing_status: ProcessingStatus::Pending,
        validation_status: ValidationStatus::Pending,
        scan_status: ScanStatus::Pending,
        uploaded_bytes: 0,
        error_count: 0,
        last_error: None,
        needs_review: false,
        storage_path: None,
        metadata: Default::default(),
        created_at: now,
        updated_at: now,
        processed_at: None,
    }
}

pub fn events() -> Arc<dyn EventLogger> {
    Arc::new(TracingEventLog)
}

/// Config rooted in a temp directory
pub fn config(root: &std::path::Path) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.storage.database_path = root.join("ingest.db");
    config.storage.objects_dir = root.join("objects");
    config.storage.staging_dir = root.join("staging");
    config.uploads.min_chunk_size = 4;
    config.uploads.default_chunk_size = 8;
    config
}

pub fn db() -> IngestDb {
    IngestDb::in_memory().expect("in-memory database")
}
