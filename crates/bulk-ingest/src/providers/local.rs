//! Local provider implementations using the filesystem
//!
//! The scanner and analyzer here are stand-ins for deployments without an
//! external engine: the scanner accepts everything and the analyzer only
//! reads plain-text families.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::FileFamily;

use super::analyzer::ContentAnalyzer;
use super::object_store::{hash_file, sha256_hex, ObjectStore, StoredObject};
use super::scanner::{ScanReport, SecurityScanner};

/// Local filesystem object store
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Create a new local object store, creating the root directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::info!("Local object store at {:?}", root);
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::validation(format!("Invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }

    async fn prepare_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<StoredObject> {
        let path = self.object_path(key)?;
        Self::prepare_parent(&path).await?;

        // Write aside, then rename so readers never see a partial object
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(StoredObject {
            uri: path.to_string_lossy().to_string(),
            size: data.len() as u64,
            sha256: sha256_hex(data),
        })
    }

    async fn adopt(&self, key: &str, source: &Path) -> Result<StoredObject> {
        let path = self.object_path(key)?;
        Self::prepare_parent(&path).await?;

        if tokio::fs::rename(source, &path).await.is_err() {
            // Staging may live on another filesystem
            tokio::fs::copy(source, &path).await?;
            tokio::fs::remove_file(source).await?;
        }

        let (sha256, size) = hash_file(&path).await?;
        Ok(StoredObject {
            uri: path.to_string_lossy().to_string(),
            size,
            sha256,
        })
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        tokio::fs::read(uri)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read object {}: {}", uri, e)))
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        let path = PathBuf::from(uri);
        path.starts_with(&self.root).then_some(path)
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        match tokio::fs::remove_file(uri).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

/// Scanner that reports every file clean
pub struct NoopScanner;

#[async_trait]
impl SecurityScanner for NoopScanner {
    async fn scan(&self, _path: &Path) -> Result<ScanReport> {
        Ok(ScanReport::clean())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Analyzer that reads text-family files as UTF-8
pub struct PlainTextAnalyzer {
    max_bytes: u64,
}

impl PlainTextAnalyzer {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl Default for PlainTextAnalyzer {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

#[async_trait]
impl ContentAnalyzer for PlainTextAnalyzer {
    async fn extract_text(&self, path: &Path, family: FileFamily) -> Result<Option<String>> {
        if family != FileFamily::Text {
            return Ok(None);
        }
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.max_bytes {
            tracing::debug!("Skipping text extraction for {:?}: {} bytes", path, size);
            return Ok(None);
        }
        let bytes = tokio::fs::read(path).await?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn perceptual_hash(&self, _path: &Path, _family: FileFamily) -> Result<Option<u64>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "plain-text"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects")).unwrap();

        let stored = store.put("tenant/file.txt", b"hello").await.unwrap();
        assert_eq!(stored.size, 5);
        assert_eq!(stored.sha256, sha256_hex(b"hello"));
        assert_eq!(store.read(&stored.uri).await.unwrap(), b"hello");
        assert!(store.local_path(&stored.uri).is_some());

        store.delete(&stored.uri).await.unwrap();
        store.delete(&stored.uri).await.unwrap();
    }

    #[tokio::test]
    async fn test_adopt_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects")).unwrap();
        let source = dir.path().join("assembled");
        tokio::fs::write(&source, b"assembled bytes").await.unwrap();

        let stored = store.adopt("t/f.bin", &source).await.unwrap();
        assert!(!source.exists());
        assert_eq!(stored.sha256, sha256_hex(b"assembled bytes"));
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        assert!(store.put("../escape", b"x").await.is_err());
    }

    #[test]
    fn test_noop_scanner_reports_clean() {
        let report = tokio_test::block_on(NoopScanner.scan(Path::new("/nonexistent"))).unwrap();
        assert!(report.clean);
        assert!(report.threats.is_empty());
        assert_eq!(NoopScanner.name(), "noop");
    }

    #[tokio::test]
    async fn test_plain_text_analyzer_only_reads_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, "protokoll 2023-05-14").await.unwrap();

        let analyzer = PlainTextAnalyzer::default();
        let text = analyzer.extract_text(&path, FileFamily::Text).await.unwrap();
        assert_eq!(text.as_deref(), Some("protokoll 2023-05-14"));
        assert!(analyzer
            .extract_text(&path, FileFamily::Image)
            .await
            .unwrap()
            .is_none());
    }
}
