//! Resumable chunked upload types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db_enum;

db_enum! {
    pub enum UploadSessionStatus {
        Pending => "pending",
        Uploading => "uploading",
        Assembling => "assembling",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        Expired => "expired",
    }
}

impl UploadSessionStatus {
    /// Terminal states are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadSessionStatus::Completed
                | UploadSessionStatus::Failed
                | UploadSessionStatus::Cancelled
                | UploadSessionStatus::Expired
        )
    }

    /// Chunks may still be written
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, UploadSessionStatus::Pending | UploadSessionStatus::Uploading)
    }
}

db_enum! {
    pub enum ChunkStatus {
        Pending => "pending",
        Uploading => "uploading",
        Uploaded => "uploaded",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

/// A resumable transfer of one large object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// File row this upload fills, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_file_id: Option<Uuid>,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub uploaded_bytes: u64,
    /// Declared whole-file SHA-256 hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// SHA-256 hex of the assembled object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_hash: Option<String>,
    pub status: UploadSessionStatus,
    pub staging_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_bytes as f64 / self.total_size as f64 * 100.0).min(100.0)
    }
}

/// One fixed-size byte range of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    pub session_id: Uuid,
    /// Zero-based ordinal
    pub chunk_index: u32,
    pub expected_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_hash: Option<String>,
    pub status: ChunkStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl UploadChunk {
    /// Byte offset of this chunk in the assembled object
    pub fn offset(&self, chunk_size: u64) -> u64 {
        self.chunk_index as u64 * chunk_size
    }
}

/// Session initialisation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUploadSession {
    pub filename: String,
    pub total_size: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub expected_hash: Option<String>,
    /// Optional per-chunk SHA-256 hex, one per chunk in order
    #[serde(default)]
    pub chunk_hashes: Option<Vec<String>>,
    #[serde(default)]
    pub batch_file_id: Option<Uuid>,
}

impl NewUploadSession {
    pub fn new(filename: impl Into<String>, total_size: u64) -> Self {
        Self {
            filename: filename.into(),
            total_size,
            chunk_size: None,
            expected_hash: None,
            chunk_hashes: None,
            batch_file_id: None,
        }
    }
}

/// What a client needs to resume a transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub session: UploadSession,
    pub completed_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
}

/// Result of writing one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUploadOutcome {
    pub chunk: UploadChunk,
    pub session: UploadSession,
    /// The chunk was already stored with identical content
    pub already_uploaded: bool,
}
