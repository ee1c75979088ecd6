//! Resumable chunked uploads

pub mod manager;
pub mod staging;

pub use manager::ChunkedUploadManager;
pub use staging::{AssembledObject, ChunkStaging};
