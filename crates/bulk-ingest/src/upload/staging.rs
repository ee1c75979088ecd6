//! On-disk staging for chunk payloads
//!
//! Layout: `<root>/<session>/<index>.part` for chunks and
//! `<root>/<session>/assembled` for the concatenated object.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::error::Result;
use crate::providers::hash_file;

/// Assembled object ready to hand to the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledObject {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Chunk staging area
#[derive(Debug, Clone)]
pub struct ChunkStaging {
    root: PathBuf,
}

impl ChunkStaging {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    pub fn chunk_path(&self, session_id: Uuid, index: u32) -> PathBuf {
        self.session_dir(session_id).join(format!("{}.part", index))
    }

    /// Write one chunk; a crash never leaves a partial `.part` behind
    pub async fn write_chunk(&self, session_id: Uuid, index: u32, data: &[u8]) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;

        let target = self.chunk_path(session_id, index);
        let temp = dir.join(format!("{}.part.{}.tmp", index, Uuid::new_v4()));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(target)
    }

    /// Hash and size of a staged chunk
    pub async fn hash_chunk(&self, session_id: Uuid, index: u32) -> Result<(String, u64)> {
        hash_file(&self.chunk_path(session_id, index)).await
    }

    /// Concatenate chunks in the given order into `assembled`
    pub async fn assemble(&self, session_id: Uuid, indices: &[u32]) -> Result<AssembledObject> {
        let path = self.session_dir(session_id).join("assembled");
        let output = fs::File::create(&path).await?;
        let mut writer = BufWriter::new(output);
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        for &index in indices {
            let mut part = fs::File::open(self.chunk_path(session_id, index)).await?;
            loop {
                let n = part.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n]).await?;
                size += n as u64;
            }
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        Ok(AssembledObject {
            path,
            sha256: hex::encode(hasher.finalize()),
            size,
        })
    }

    /// Remove everything staged for a session; true if something was removed
    pub async fn remove_session(&self, session_id: Uuid) -> Result<bool> {
        remove_dir(&self.session_dir(session_id)).await
    }
}

async fn remove_dir(dir: &Path) -> Result<bool> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sha256_hex;

    #[tokio::test]
    async fn test_assembly_is_ordinal_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let staging = ChunkStaging::new(dir.path()).unwrap();
        let session = Uuid::new_v4();

        // Written out of order
        staging.write_chunk(session, 2, b"cc").await.unwrap();
        staging.write_chunk(session, 0, b"aaaa").await.unwrap();
        staging.write_chunk(session, 1, b"bbbb").await.unwrap();

        let first = staging.assemble(session, &[0, 1, 2]).await.unwrap();
        let bytes = tokio::fs::read(&first.path).await.unwrap();
        assert_eq!(bytes, b"aaaabbbbcc");
        assert_eq!(first.sha256, sha256_hex(b"aaaabbbbcc"));
        assert_eq!(first.size, 10);

        let second = staging.assemble(session, &[0, 1, 2]).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_chunk_and_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let staging = ChunkStaging::new(dir.path()).unwrap();
        let session = Uuid::new_v4();

        staging.write_chunk(session, 0, b"bad!").await.unwrap();
        staging.write_chunk(session, 0, b"good").await.unwrap();
        let (hash, size) = staging.hash_chunk(session, 0).await.unwrap();
        assert_eq!(hash, sha256_hex(b"good"));
        assert_eq!(size, 4);

        assert!(staging.remove_session(session).await.unwrap());
        assert!(!staging.remove_session(session).await.unwrap());
    }
}
