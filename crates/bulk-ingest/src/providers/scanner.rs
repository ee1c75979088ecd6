//! Security scanner provider trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Outcome of scanning one stored object
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanReport {
    pub clean: bool,
    /// Threat names reported by the engine
    #[serde(default)]
    pub threats: Vec<String>,
}

impl ScanReport {
    pub fn clean() -> Self {
        Self {
            clean: true,
            threats: Vec::new(),
        }
    }

    pub fn infected(threats: Vec<String>) -> Self {
        Self {
            clean: false,
            threats,
        }
    }
}

/// Trait for virus/malware scanning engines
///
/// Implementations:
/// - `NoopScanner`: accepts everything, for deployments without an engine
#[async_trait]
pub trait SecurityScanner: Send + Sync {
    /// Scan a file on local disk
    async fn scan(&self, path: &Path) -> Result<ScanReport>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
