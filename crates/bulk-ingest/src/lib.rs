//! bulk-ingest: bulk upload orchestration for a multi-tenant document portal
//!
//! Tenants create batches of files, upload them directly or through resumable
//! chunked sessions, and have them processed by a priority queue dispatched to
//! registered workers. Processed files are scanned for duplicates, and every
//! client-facing operation sits behind sliding-window rate limits.
//!
//! [`IngestService`] is the tenant-scoped entry point; the component managers
//! are public for embedding and testing.

pub mod batch;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod processing;
pub mod providers;
pub mod rate_limit;
pub mod service;
pub mod storage;
pub mod types;
pub mod upload;

#[cfg(test)]
mod testing;

pub use config::IngestConfig;
pub use error::{Error, ErrorKind, Result};
pub use service::{IngestService, RequestContext};
pub use types::{
    batch::{Batch, BatchFile, BatchStatus, NewBatch, NewBatchFile},
    duplicate::{DetectionOptions, DetectionScope, ResolutionAction},
    upload::{NewUploadSession, UploadSession},
};
