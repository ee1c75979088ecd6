//! Duplicate detection output types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db_enum;

db_enum! {
    /// Similarity algorithms, listed in tie-break priority order
    pub enum DetectionAlgorithm {
        ContentHash => "content_hash",
        Perceptual => "perceptual",
        Text => "text",
        Metadata => "metadata",
        FuzzyFilename => "fuzzy_filename",
    }
}

impl DetectionAlgorithm {
    pub const ALL: [DetectionAlgorithm; 5] = [
        DetectionAlgorithm::ContentHash,
        DetectionAlgorithm::Perceptual,
        DetectionAlgorithm::Text,
        DetectionAlgorithm::Metadata,
        DetectionAlgorithm::FuzzyFilename,
    ];

    /// Lower wins when two algorithms report the same score
    pub fn priority(&self) -> u8 {
        match self {
            DetectionAlgorithm::ContentHash => 0,
            DetectionAlgorithm::Perceptual => 1,
            DetectionAlgorithm::Text => 2,
            DetectionAlgorithm::Metadata => 3,
            DetectionAlgorithm::FuzzyFilename => 4,
        }
    }
}

db_enum! {
    pub enum Confidence {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

impl Confidence {
    fn rank(&self) -> u8 {
        match self {
            Confidence::Low => 0,
            Confidence::Medium => 1,
            Confidence::High => 2,
        }
    }

    pub fn downgrade(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            _ => Confidence::Low,
        }
    }

    pub fn upgrade(self) -> Self {
        match self {
            Confidence::Low => Confidence::Medium,
            _ => Confidence::High,
        }
    }
}

impl PartialOrd for Confidence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Confidence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

db_enum! {
    pub enum RecommendedAction {
        /// Same bytes: drop the non-master copy
        DeleteDuplicate => "delete_duplicate",
        KeepNewest => "keep_newest",
        KeepLargest => "keep_largest",
        ManualReview => "manual_review",
    }
}

db_enum! {
    pub enum DuplicateStatus {
        Pending => "pending",
        Resolved => "resolved",
    }
}

db_enum! {
    /// Action recorded when a record is resolved
    pub enum ResolutionAction {
        KeepBoth => "keep_both",
        /// Keep `file_a`, mark `file_b` duplicate
        KeepFirst => "keep_first",
        /// Keep `file_b`, mark `file_a` duplicate
        KeepSecond => "keep_second",
        /// Mark the non-master file duplicate of the group master
        MarkDuplicate => "mark_duplicate",
    }
}

db_enum! {
    pub enum ResolutionStrategy {
        KeepNewest => "keep_newest",
        KeepLargest => "keep_largest",
        ManualReview => "manual_review",
    }
}

db_enum! {
    pub enum DetectionStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

/// What a detection session compares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "batch_id", rename_all = "snake_case")]
pub enum DetectionScope {
    /// Files of one batch against each other and the tenant corpus
    Batch(Uuid),
    /// Every processed file of the tenant
    Tenant,
}

impl DetectionScope {
    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            DetectionScope::Batch(id) => Some(*id),
            DetectionScope::Tenant => None,
        }
    }
}

/// Caller options for a detection session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionOptions {
    /// Overrides the configured algorithm list
    #[serde(default)]
    pub algorithms: Option<Vec<DetectionAlgorithm>>,
    /// Resolve auto-resolvable groups right after detection
    #[serde(default)]
    pub auto_resolve: bool,
}

/// Score one algorithm produced for a pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AlgorithmScore {
    pub algorithm: DetectionAlgorithm,
    pub score: f64,
    /// None when below the algorithm's low threshold
    pub confidence: Option<Confidence>,
}

db_enum! {
    pub enum DomainSignalKind {
        ReferenceNumber => "reference_number",
        MeetingDate => "meeting_date",
        ApartmentReference => "apartment_reference",
    }
}

/// A domain identifier found in both files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainSignal {
    pub kind: DomainSignalKind,
    pub value_a: String,
    pub value_b: String,
    /// Both files carry the same value
    pub agrees: bool,
}

/// Comparison details stored with a record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComparisonMetrics {
    pub scores: Vec<AlgorithmScore>,
    #[serde(default)]
    pub domain_signals: Vec<DomainSignal>,
    /// smaller size / larger size
    pub size_ratio: f64,
    pub filename_similarity: f64,
}

/// One detected duplicate pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    /// Smaller id of the pair
    pub file_a: Uuid,
    pub file_b: Uuid,
    pub algorithm: DetectionAlgorithm,
    pub similarity: f64,
    pub confidence: Confidence,
    pub recommended_action: RecommendedAction,
    pub auto_resolvable: bool,
    pub metrics: ComparisonMetrics,
    pub status: DuplicateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DuplicateRecord {
    pub fn other(&self, file_id: Uuid) -> Option<Uuid> {
        if file_id == self.file_a {
            Some(self.file_b)
        } else if file_id == self.file_b {
            Some(self.file_a)
        } else {
            None
        }
    }
}

/// Member of a duplicate group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMember {
    pub file_id: Uuid,
    pub is_master: bool,
    pub quality_score: f64,
    pub size_bytes: u64,
}

/// Connected component of duplicate pairs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub master_file_id: Uuid,
    pub members: Vec<GroupMember>,
    pub total_size: u64,
    pub strategy: ResolutionStrategy,
    pub auto_resolvable: bool,
    /// Quality score of the master
    pub quality_score: f64,
    /// Mean similarity over the group's records
    pub confidence_score: f64,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl DuplicateGroup {
    pub fn master(&self) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.is_master)
    }
}

/// A detection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub scope: DetectionScope,
    pub status: DetectionStatus,
    pub algorithms: Vec<DetectionAlgorithm>,
    pub files_considered: u32,
    pub pairs_compared: u32,
    pub matches_found: u32,
    pub groups_created: u32,
    pub errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
