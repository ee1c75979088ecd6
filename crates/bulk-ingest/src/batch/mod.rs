//! Batch lifecycle: creation, file admission, state machine and cancellation

pub mod manager;
pub mod validation;

pub use manager::{next_status, progress_percent, BatchCompletion, BatchManager, StartBatchOptions};
pub use validation::{extension_of, normalize_extension, sanitize_filename, validate_sha256};
