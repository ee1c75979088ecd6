//! Batch and batch file types
//!
//! A file carries independent status axes (upload, processing, validation,
//! scan) because each one advances on its own schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::db_enum;

db_enum! {
    /// Batch lifecycle
    pub enum BatchStatus {
        Pending => "pending",
        Validating => "validating",
        Uploading => "uploading",
        Processing => "processing",
        Completed => "completed",
        PartiallyCompleted => "partially_completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl BatchStatus {
    /// No further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::PartiallyCompleted
                | BatchStatus::Failed
                | BatchStatus::Cancelled
        )
    }

    /// Satisfies queue dependencies on this batch
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, BatchStatus::Completed)
    }
}

db_enum! {
    /// How files inside a batch are processed
    pub enum ConcurrencyMode {
        Parallel => "parallel",
        Sequential => "sequential",
    }
}

db_enum! {
    /// What happens when a file's content hash already exists for the tenant
    pub enum DuplicatePolicy {
        /// Mark the file skipped and point it at the existing copy
        Skip => "skip",
        /// Keep it, but flag for manual review
        Flag => "flag",
        /// Keep it, only record the duplicate pointer
        KeepBoth => "keep_both",
    }
}

db_enum! {
    pub enum UploadStatus {
        Pending => "pending",
        Uploading => "uploading",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

db_enum! {
    pub enum ProcessingStatus {
        Pending => "pending",
        Queued => "queued",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
    }
}

db_enum! {
    pub enum ValidationStatus {
        Pending => "pending",
        Valid => "valid",
        Invalid => "invalid",
    }
}

db_enum! {
    pub enum ScanStatus {
        Pending => "pending",
        Clean => "clean",
        Infected => "infected",
        Error => "error",
        Skipped => "skipped",
    }
}

db_enum! {
    /// Coarse type family used to decide which files are comparable
    pub enum FileFamily {
        Document => "document",
        Spreadsheet => "spreadsheet",
        Presentation => "presentation",
        Image => "image",
        Text => "text",
        Archive => "archive",
        Other => "other",
    }
}

impl FileFamily {
    /// Detect family from a file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "pdf" | "doc" | "docx" | "odt" | "rtf" | "pages" => Self::Document,
            "xls" | "xlsx" | "ods" | "numbers" => Self::Spreadsheet,
            "ppt" | "pptx" | "odp" | "key" => Self::Presentation,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "heic" => {
                Self::Image
            }
            "txt" | "md" | "markdown" | "csv" | "html" | "htm" => Self::Text,
            "zip" | "7z" | "tar" | "gz" => Self::Archive,
            _ => Self::Other,
        }
    }
}

/// Capacity limits applied to one batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchLimits {
    pub max_files: u32,
    pub max_total_bytes: u64,
    pub max_file_size: u64,
    /// Lowercase extensions without the dot
    pub allowed_extensions: Vec<String>,
}

impl BatchLimits {
    pub fn allows_extension(&self, extension: &str) -> bool {
        let ext = extension.to_lowercase();
        self.allowed_extensions.iter().any(|allowed| *allowed == ext)
    }
}

/// Tenant-scoped unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Ordinal per tenant, starting at 1
    pub batch_number: i64,
    pub status: BatchStatus,
    pub total_files: u32,
    pub uploaded_files: u32,
    /// Files whose processing completed
    pub processed_files: u32,
    pub failed_files: u32,
    pub skipped_files: u32,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub processed_bytes: u64,
    /// Derived from file counts, 0..=100
    pub progress: f64,
    pub limits: BatchLimits,
    pub duplicate_policy: DuplicatePolicy,
    pub concurrency_mode: ConcurrencyMode,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Files in a terminal state
    pub fn finished_files(&self) -> u32 {
        self.processed_files + self.failed_files + self.skipped_files
    }
}

/// One submitted file within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub tenant_id: Uuid,
    pub original_filename: String,
    pub sanitized_filename: String,
    /// Lowercase, without the dot
    pub extension: String,
    pub size_bytes: u64,
    pub content_type: String,
    /// SHA-256 hex of the stored content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// SHA-256 hex the client declared up front
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_hash: Option<String>,
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
    pub processing_order: u32,
    pub priority: u8,
    pub upload_status: UploadStatus,
    pub processing_status: ProcessingStatus,
    pub validation_status: ValidationStatus,
    pub scan_status: ScanStatus,
    pub uploaded_bytes: u64,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    /// Client-supplied descriptive fields (title, author, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl BatchFile {
    /// Both axes have settled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.processing_status,
            ProcessingStatus::Completed | ProcessingStatus::Failed | ProcessingStatus::Skipped
        ) || matches!(self.upload_status, UploadStatus::Failed | UploadStatus::Cancelled)
    }

    pub fn family(&self) -> FileFamily {
        FileFamily::from_extension(&self.extension)
    }
}

/// Request to create a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub name: String,
    /// Lower the tenant's file ceiling for this batch
    #[serde(default)]
    pub max_files: Option<u32>,
    /// Lower the tenant's byte ceiling for this batch
    #[serde(default)]
    pub max_total_bytes: Option<u64>,
    /// Restrict the tenant's extension allow-list for this batch
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default = "default_concurrency_mode")]
    pub concurrency_mode: ConcurrencyMode,
    #[serde(default)]
    pub priority: Option<u8>,
}

fn default_duplicate_policy() -> DuplicatePolicy { DuplicatePolicy::Flag }
fn default_concurrency_mode() -> ConcurrencyMode { ConcurrencyMode::Parallel }

impl NewBatch {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_files: None,
            max_total_bytes: None,
            allowed_extensions: None,
            duplicate_policy: default_duplicate_policy(),
            concurrency_mode: default_concurrency_mode(),
            priority: None,
        }
    }
}

/// Request to add one file to a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatchFile {
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub declared_hash: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewBatchFile {
    pub fn new(filename: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            size_bytes,
            content_type: None,
            declared_hash: None,
            priority: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Aggregate view returned by get-batch-progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub batch_number: i64,
    pub status: BatchStatus,
    pub total_files: u32,
    pub uploaded_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    pub skipped_files: u32,
    pub pending_files: u32,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub processed_bytes: u64,
    pub percent_complete: f64,
    pub files_needing_review: u32,
    pub updated_at: DateTime<Utc>,
}

/// Per-tenant overrides of the batch defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TenantSettings {
    pub tenant_id: Uuid,
    pub max_files_per_batch: Option<u32>,
    pub max_batch_bytes: Option<u64>,
    pub max_file_size: Option<u64>,
    pub allowed_extensions: Option<Vec<String>>,
    pub max_active_batches: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DbEnum;

    #[test]
    fn test_status_round_trip_and_terminality() {
        assert_eq!(
            BatchStatus::from_db("partially_completed"),
            Some(BatchStatus::PartiallyCompleted)
        );
        assert_eq!(BatchStatus::from_db("bogus"), None);
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Cancelled.is_terminal_success());
        assert!(!BatchStatus::Processing.is_terminal());
    }

    #[test]
    fn test_file_family() {
        assert_eq!(FileFamily::from_extension("PDF"), FileFamily::Document);
        assert_eq!(FileFamily::from_extension("jpeg"), FileFamily::Image);
        assert_eq!(FileFamily::from_extension("xyz"), FileFamily::Other);
    }

    #[test]
    fn test_serde_uses_db_strings() {
        let json = serde_json::to_string(&DuplicatePolicy::KeepBoth).unwrap();
        assert_eq!(json, "\"keep_both\"");
    }
}
