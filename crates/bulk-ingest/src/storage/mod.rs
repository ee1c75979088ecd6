//! Storage module for persistent data storage
//!
//! Provides SQLite-based persistence for batches, queue items, workers,
//! chunked uploads, duplicate detection output, rate limit usage and the
//! event log.

mod batches;
mod database;
mod duplicates;
mod events;
mod queue;
mod rate_limits;
mod uploads;
mod workers;

pub use batches::FileAggregates;
pub use database::IngestDb;
pub use rate_limits::WindowUsage;
pub use uploads::ChunkMark;
