//! Content analyzer provider trait (text extraction, perceptual hashing)

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::types::FileFamily;

/// Trait for content extraction used by duplicate detection
///
/// Both methods return `None` when the analyzer has nothing to offer for the
/// file; that simply disables the corresponding similarity algorithm.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    /// Extract plain text (OCR or native parsing)
    async fn extract_text(&self, path: &Path, family: FileFamily) -> Result<Option<String>>;

    /// 64-bit perceptual hash of an image
    async fn perceptual_hash(&self, path: &Path, family: FileFamily) -> Result<Option<u64>>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
