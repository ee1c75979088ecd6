//! Core types for the bulk ingest system

pub mod batch;
pub mod duplicate;
pub mod queue;
pub mod rate_limit;
pub mod upload;
pub mod worker;

pub use batch::{
    Batch, BatchFile, BatchLimits, BatchProgress, BatchStatus, ConcurrencyMode, DuplicatePolicy,
    FileFamily, NewBatch, NewBatchFile, ProcessingStatus, ScanStatus, TenantSettings,
    UploadStatus, ValidationStatus,
};
pub use duplicate::{
    AlgorithmScore, ComparisonMetrics, Confidence, DetectionAlgorithm, DetectionOptions,
    DetectionScope, DetectionSession, DetectionStatus, DomainSignal, DomainSignalKind,
    DuplicateGroup, DuplicateRecord, DuplicateStatus, GroupMember, RecommendedAction,
    ResolutionAction, ResolutionStrategy,
};
pub use queue::{
    FailureOutcome, NewQueueItem, QueueItem, QueueItemStatus, QueueStats, QueueType,
    ResourceRequirements,
};
pub use rate_limit::RateLimitDecision;
pub use upload::{
    ChunkStatus, ChunkUploadOutcome, NewUploadSession, ResumeInfo, UploadChunk, UploadSession,
    UploadSessionStatus,
};
pub use worker::{
    Worker, WorkerCapacity, WorkerHealth, WorkerLoad, WorkerRegistration, WorkerStatus, WorkerType,
};

/// Enum with a single canonical string form, used for storage and serde
pub trait DbEnum: Sized + Copy {
    fn as_str(&self) -> &'static str;
    fn from_db(value: &str) -> Option<Self>;
}

/// Declare a unit enum together with its snake_case string mapping
macro_rules! db_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $crate::types::DbEnum for $name {
            fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }

            fn from_db(value: &str) -> Option<Self> {
                match value {
                    $( $text => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::types::DbEnum::as_str(self))
            }
        }
    };
}

pub(crate) use db_enum;
