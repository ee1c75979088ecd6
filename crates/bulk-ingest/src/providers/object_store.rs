//! Object store provider trait for durable file content

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::error::Result;

/// Where and what was stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Storage URI (file path for the local store)
    pub uri: String,
    pub size: u64,
    /// SHA-256 hex of the content
    pub sha256: String,
}

/// Trait for durable object storage
///
/// Implementations:
/// - `LocalObjectStore`: local filesystem
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `key`
    async fn put(&self, key: &str, data: &[u8]) -> Result<StoredObject>;

    /// Move an already-written local file under `key`
    async fn adopt(&self, key: &str, source: &Path) -> Result<StoredObject>;

    /// Read an object back
    async fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// Local path for collaborators that need a file on disk
    fn local_path(&self, uri: &str) -> Option<PathBuf>;

    /// Delete an object, missing objects are ignored
    async fn delete(&self, uri: &str) -> Result<()>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Storage key for a batch file's content
pub fn object_key(tenant_id: &uuid::Uuid, file_id: &uuid::Uuid, extension: &str) -> String {
    if extension.is_empty() {
        format!("{}/{}", tenant_id, file_id)
    } else {
        format!("{}/{}.{}", tenant_id, file_id, extension)
    }
}

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file, streamed in 64KB reads
pub async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_hash_file_matches_slice_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data = vec![7u8; 200_000];
        tokio::fs::write(&path, &data).await.unwrap();

        let (hash, size) = hash_file(&path).await.unwrap();
        assert_eq!(size, 200_000);
        assert_eq!(hash, sha256_hex(&data));
    }
}
