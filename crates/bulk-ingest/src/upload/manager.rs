//! Chunked upload manager
//!
//! Resumable transfers: a session pre-creates its whole chunk range, chunks
//! are verified and staged independently (up to a per-session fan-out), and
//! the last chunk triggers assembly. Assembly is single-writer through the
//! `uploading -> assembling` transition.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::batch::{extension_of, sanitize_filename, validate_sha256, BatchManager};
use crate::config::ChunkedUploadConfig;
use crate::error::{Error, Result};
use crate::events::EventLogger;
use crate::providers::{object_key, sha256_hex, ObjectStore};
use crate::storage::{ChunkMark, IngestDb};
use crate::types::{
    ChunkStatus, ChunkUploadOutcome, NewUploadSession, ResumeInfo, UploadChunk, UploadSession,
    UploadSessionStatus, UploadStatus,
};

use super::staging::ChunkStaging;

const OPEN: [UploadSessionStatus; 2] = [UploadSessionStatus::Pending, UploadSessionStatus::Uploading];

const TERMINAL: [UploadSessionStatus; 4] = [
    UploadSessionStatus::Completed,
    UploadSessionStatus::Failed,
    UploadSessionStatus::Cancelled,
    UploadSessionStatus::Expired,
];

/// A chunk claimed for writing.
///
/// Dropping it before `disarm` hands the chunk back, so a cancelled or
/// failed write never leaves it stuck in `uploading`.
struct ChunkClaim<'a> {
    db: &'a IngestDb,
    session_id: Uuid,
    index: u32,
    armed: bool,
}

impl<'a> ChunkClaim<'a> {
    fn new(db: &'a IngestDb, session_id: Uuid, index: u32) -> Self {
        Self {
            db,
            session_id,
            index,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ChunkClaim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.db.release_upload_chunk(self.session_id, self.index) {
            tracing::warn!(
                "Releasing chunk {} of session {} failed: {}",
                self.index,
                self.session_id,
                e
            );
        }
    }
}

/// Manager for resumable chunked uploads
pub struct ChunkedUploadManager {
    db: IngestDb,
    config: ChunkedUploadConfig,
    staging: ChunkStaging,
    store: Arc<dyn ObjectStore>,
    batches: Arc<BatchManager>,
    events: Arc<dyn EventLogger>,
    fan_out: DashMap<Uuid, Arc<Semaphore>>,
}

impl ChunkedUploadManager {
    pub fn new(
        db: IngestDb,
        config: ChunkedUploadConfig,
        staging: ChunkStaging,
        store: Arc<dyn ObjectStore>,
        batches: Arc<BatchManager>,
        events: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            db,
            config,
            staging,
            store,
            batches,
            events,
            fan_out: DashMap::new(),
        }
    }

    /// Backoff a client should wait before retrying a failed chunk
    pub fn retry_delay(&self, retry_count: u32) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.config
                .retry_base_ms
                .saturating_mul(1u64 << retry_count.min(16)),
        )
    }

    /// Open a session and pre-create its chunk range
    pub fn create_session(&self, tenant_id: Uuid, request: NewUploadSession) -> Result<UploadSession> {
        let filename = sanitize_filename(&request.filename)?;
        let config = &self.config;

        if request.total_size == 0 || request.total_size > config.max_file_size {
            return Err(Error::validation(format!(
                "Upload size must be between 1 and {} bytes, got {}",
                config.max_file_size, request.total_size
            )));
        }

        let chunk_size = request.chunk_size.unwrap_or(config.default_chunk_size);
        if chunk_size < config.min_chunk_size || chunk_size > config.max_chunk_size {
            return Err(Error::validation(format!(
                "Chunk size {} outside [{}, {}]",
                chunk_size, config.min_chunk_size, config.max_chunk_size
            )));
        }

        let total_chunks = request.total_size.div_ceil(chunk_size);
        let total_chunks = u32::try_from(total_chunks)
            .map_err(|_| Error::validation(format!("{} chunks is too many", total_chunks)))?;

        let mut expected_hash = request.expected_hash.as_deref().map(validate_sha256).transpose()?;

        let chunk_hashes = match &request.chunk_hashes {
            Some(hashes) if hashes.len() != total_chunks as usize => {
                return Err(Error::validation(format!(
                    "{} chunk hashes given for {} chunks",
                    hashes.len(),
                    total_chunks
                )))
            }
            Some(hashes) => Some(
                hashes
                    .iter()
                    .map(|h| validate_sha256(h))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };

        if let Some(file_id) = request.batch_file_id {
            let file = self.batches.get_file(tenant_id, file_id)?;
            if file.upload_status != UploadStatus::Pending && file.upload_status != UploadStatus::Uploading {
                return Err(Error::invalid_state(format!(
                    "Upload of '{}' is {}",
                    file.sanitized_filename, file.upload_status
                )));
            }
            if file.size_bytes != request.total_size {
                return Err(Error::validation(format!(
                    "'{}' was declared as {} bytes, session says {}",
                    file.sanitized_filename, file.size_bytes, request.total_size
                )));
            }
            match (&expected_hash, &file.declared_hash) {
                (Some(session), Some(declared)) if session != declared => {
                    return Err(Error::validation(format!(
                        "Session hash differs from the hash declared for '{}'",
                        file.sanitized_filename
                    )))
                }
                (None, Some(declared)) => expected_hash = Some(declared.clone()),
                _ => {}
            }
        }

        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let session = UploadSession {
            id: session_id,
            tenant_id,
            batch_file_id: request.batch_file_id,
            filename,
            total_size: request.total_size,
            chunk_size,
            total_chunks,
            uploaded_chunks: 0,
            uploaded_bytes: 0,
            expected_hash,
            final_hash: None,
            status: UploadSessionStatus::Pending,
            staging_dir: self.staging.session_dir(session_id).display().to_string(),
            final_path: None,
            error: None,
            expires_at: now + Duration::seconds(config.session_ttl_secs as i64),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let chunks: Vec<UploadChunk> = (0..total_chunks)
            .map(|index| {
                let offset = index as u64 * chunk_size;
                UploadChunk {
                    session_id,
                    chunk_index: index,
                    expected_size: chunk_size.min(request.total_size - offset),
                    actual_size: None,
                    expected_hash: chunk_hashes.as_ref().map(|h| h[index as usize].clone()),
                    actual_hash: None,
                    status: ChunkStatus::Pending,
                    retry_count: 0,
                    last_error: None,
                    uploaded_at: None,
                }
            })
            .collect();

        self.db.insert_upload_session(&session, &chunks)?;

        self.events.info(
            Some(tenant_id),
            "upload.session_created",
            &format!(
                "Upload session for '{}' created: {} bytes in {} chunks",
                session.filename, session.total_size, session.total_chunks
            ),
            json!({
                "session_id": session.id,
                "batch_file_id": session.batch_file_id,
                "chunk_size": chunk_size,
                "total_chunks": total_chunks,
            }),
        );
        Ok(session)
    }

    pub fn get_session(&self, tenant_id: Uuid, session_id: Uuid) -> Result<UploadSession> {
        self.db
            .get_upload_session(session_id)?
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("upload session", session_id))
    }

    pub fn list_chunks(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Vec<UploadChunk>> {
        self.get_session(tenant_id, session_id)?;
        self.db.list_upload_chunks(session_id)
    }

    /// Verify and stage one chunk; the last one triggers assembly
    pub async fn upload_chunk(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        index: u32,
        data: Bytes,
        declared_hash: Option<&str>,
    ) -> Result<ChunkUploadOutcome> {
        let session = self.live_session(tenant_id, session_id, Utc::now())?;
        if index >= session.total_chunks {
            return Err(Error::validation(format!(
                "Chunk {} out of range, session has {} chunks",
                index, session.total_chunks
            )));
        }
        let declared_hash = declared_hash.map(validate_sha256).transpose()?;

        let chunk = self
            .db
            .get_upload_chunk(session_id, index)?
            .ok_or_else(|| Error::not_found("chunk", format!("{}/{}", session_id, index)))?;

        let hash = sha256_hex(&data);

        if chunk.status == ChunkStatus::Uploaded {
            if chunk.actual_hash.as_deref() == Some(hash.as_str()) {
                return Ok(ChunkUploadOutcome {
                    chunk,
                    session,
                    already_uploaded: true,
                });
            }
            return Err(Error::Conflict(format!(
                "Chunk {} of session {} was already uploaded with different content",
                index, session_id
            )));
        }
        if chunk.status == ChunkStatus::Failed && chunk.retry_count >= self.config.max_chunk_retries {
            return Err(Error::RetryLimitExceeded(format!(
                "Chunk {} failed {} times, resubmit the upload",
                index, chunk.retry_count
            )));
        }
        if data.len() as u64 != chunk.expected_size {
            return Err(Error::validation(format!(
                "Chunk {} must be {} bytes, got {}",
                index,
                chunk.expected_size,
                data.len()
            )));
        }

        let semaphore = self
            .fan_out
            .entry(session_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_parallel_chunks.max(1))))
            .clone();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("Chunk fan-out closed"))?;

        if !self.db.claim_upload_chunk(session_id, index)? {
            return Err(Error::Conflict(format!(
                "Chunk {} of session {} is being written or the session is closed",
                index, session_id
            )));
        }
        let claim = ChunkClaim::new(&self.db, session_id, index);

        if let Some(expected) = chunk.expected_hash.as_ref().or(declared_hash.as_ref()) {
            if *expected != hash {
                let retries = self
                    .db
                    .mark_chunk_failed(session_id, index, "hash mismatch")?;
                let delay = self.retry_delay(retries);
                self.events.warn(
                    Some(tenant_id),
                    "upload.chunk_failed",
                    &format!(
                        "Chunk {} of '{}' failed verification (attempt {})",
                        index, session.filename, retries
                    ),
                    json!({
                        "session_id": session_id,
                        "chunk_index": index,
                        "retry_count": retries,
                        "retry_after_ms": delay.as_millis() as u64,
                    }),
                );
                return Err(Error::integrity(format!(
                    "Chunk {} hash mismatch, retry in {}ms",
                    index,
                    delay.as_millis()
                )));
            }
        }

        if let Err(e) = self.staging.write_chunk(session_id, index, &data).await {
            let retries = self
                .db
                .mark_chunk_failed(session_id, index, &e.to_string())?;
            tracing::warn!("Staging chunk {} of session {} failed: {}", index, session_id, e);
            return Err(Error::Transient(format!(
                "Chunk {} could not be stored, retry in {}ms",
                index,
                self.retry_delay(retries).as_millis()
            )));
        }

        let session_started = match self.db.mark_chunk_uploaded(
            session_id,
            index,
            data.len() as u64,
            &hash,
            Utc::now(),
        )? {
            ChunkMark::Uploaded { session_started } => session_started,
            ChunkMark::Stale => {
                return Err(Error::invalid_state(format!(
                    "Chunk {} of session {} was cancelled while uploading",
                    index, session_id
                )))
            }
        };
        claim.disarm();

        if session_started {
            self.events.info(
                Some(tenant_id),
                "upload.started",
                &format!("Upload of '{}' started", session.filename),
                json!({ "session_id": session_id, "from": "pending", "to": "uploading" }),
            );
        }
        self.events.info(
            Some(tenant_id),
            "upload.chunk_uploaded",
            &format!(
                "Chunk {} of '{}' stored ({} bytes)",
                index,
                session.filename,
                data.len()
            ),
            json!({
                "session_id": session_id,
                "chunk_index": index,
                "size": data.len(),
                "sha256": hash,
            }),
        );
        drop(_permit);

        let mut session = self.get_session(tenant_id, session_id)?;
        if let Some(file_id) = session.batch_file_id {
            if let Err(e) =
                self.batches
                    .update_file_upload_progress(tenant_id, file_id, session.uploaded_bytes)
            {
                tracing::debug!("Upload progress for file {} not recorded: {}", file_id, e);
            }
        }

        if session.uploaded_chunks == session.total_chunks {
            session = self.assemble(tenant_id, session_id).await?;
        }

        let chunk = self
            .db
            .get_upload_chunk(session_id, index)?
            .ok_or_else(|| Error::not_found("chunk", format!("{}/{}", session_id, index)))?;

        Ok(ChunkUploadOutcome {
            chunk,
            session,
            already_uploaded: false,
        })
    }

    /// Concatenate, verify and store a fully uploaded session.
    ///
    /// Returns the session unchanged when another caller is already
    /// assembling it.
    pub async fn assemble(&self, tenant_id: Uuid, session_id: Uuid) -> Result<UploadSession> {
        let session = self.get_session(tenant_id, session_id)?;
        let chunks = self.db.list_upload_chunks(session_id)?;
        if chunks.iter().any(|c| c.status != ChunkStatus::Uploaded) {
            return Err(Error::invalid_state(format!(
                "Session {} still has chunks to upload",
                session_id
            )));
        }

        if !self.db.transition_upload_session(
            session_id,
            &[UploadSessionStatus::Uploading],
            UploadSessionStatus::Assembling,
            None,
            Utc::now(),
        )? {
            return self.get_session(tenant_id, session_id);
        }
        self.events.info(
            Some(tenant_id),
            "upload.assembling",
            &format!("Assembling '{}' from {} chunks", session.filename, chunks.len()),
            json!({ "session_id": session_id, "from": "uploading", "to": "assembling" }),
        );

        for chunk in &chunks {
            let (hash, size) = match self.staging.hash_chunk(session_id, chunk.chunk_index).await {
                Ok(found) => found,
                Err(e) => {
                    return Err(self.fail_session(
                        &session,
                        Error::integrity(format!("Chunk {} missing from staging: {}", chunk.chunk_index, e)),
                    ))
                }
            };
            if Some(hash.as_str()) != chunk.actual_hash.as_deref() || Some(size) != chunk.actual_size {
                return Err(self.fail_session(
                    &session,
                    Error::integrity(format!(
                        "Staged chunk {} does not match its recorded hash",
                        chunk.chunk_index
                    )),
                ));
            }
        }

        let indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let assembled = match self.staging.assemble(session_id, &indices).await {
            Ok(assembled) => assembled,
            Err(e) => return Err(self.fail_session(&session, e)),
        };

        if assembled.size != session.total_size {
            return Err(self.fail_session(
                &session,
                Error::integrity(format!(
                    "Assembled {} bytes, expected {}",
                    assembled.size, session.total_size
                )),
            ));
        }
        if self.config.verify_assembled_hash {
            if let Some(expected) = &session.expected_hash {
                if *expected != assembled.sha256 {
                    return Err(self.fail_session(
                        &session,
                        Error::integrity(format!(
                            "Assembled file hash {} does not match expected {}",
                            assembled.sha256, expected
                        )),
                    ));
                }
            }
        }

        let object_id = session.batch_file_id.unwrap_or(session.id);
        let key = object_key(&tenant_id, &object_id, &extension_of(&session.filename));
        let stored = match self.store.adopt(&key, &assembled.path).await {
            Ok(stored) => stored,
            Err(e) => return Err(self.fail_session(&session, e)),
        };

        if !self
            .db
            .complete_upload_session(session_id, &stored.sha256, &stored.uri, Utc::now())?
        {
            // Cancelled during assembly; the object is orphaned
            let _ = self.store.delete(&stored.uri).await;
            return Err(Error::invalid_state(format!(
                "Session {} was closed during assembly",
                session_id
            )));
        }
        self.fan_out.remove(&session_id);

        self.events.info(
            Some(tenant_id),
            "upload.completed",
            &format!(
                "'{}' assembled from {} chunks ({} bytes)",
                session.filename, session.total_chunks, stored.size
            ),
            json!({
                "session_id": session_id,
                "sha256": stored.sha256,
                "batch_file_id": session.batch_file_id,
            }),
        );

        if let Err(e) = self.staging.remove_session(session_id).await {
            tracing::warn!("Staging cleanup for session {} failed: {}", session_id, e);
        }

        if let Some(file_id) = session.batch_file_id {
            self.batches.attach_uploaded_object(tenant_id, file_id, &stored)?;
        }

        self.get_session(tenant_id, session_id)
    }

    /// Completed and missing chunk ordinals of a live session
    pub fn resume(&self, tenant_id: Uuid, session_id: Uuid) -> Result<ResumeInfo> {
        let session = self.get_session(tenant_id, session_id)?;
        if session.status != UploadSessionStatus::Completed {
            self.live_session(tenant_id, session_id, Utc::now())?;
        }

        let (completed, missing): (Vec<UploadChunk>, Vec<UploadChunk>) = self
            .db
            .list_upload_chunks(session_id)?
            .into_iter()
            .partition(|c| c.status == ChunkStatus::Uploaded);

        Ok(ResumeInfo {
            session: self.get_session(tenant_id, session_id)?,
            completed_chunks: completed.iter().map(|c| c.chunk_index).collect(),
            missing_chunks: missing.iter().map(|c| c.chunk_index).collect(),
        })
    }

    /// Cancel an open session; written chunks stay as they are
    pub async fn cancel(&self, tenant_id: Uuid, session_id: Uuid, reason: &str) -> Result<UploadSession> {
        let session = self.get_session(tenant_id, session_id)?;
        if session.status == UploadSessionStatus::Cancelled {
            return Ok(session);
        }

        let open = [
            UploadSessionStatus::Pending,
            UploadSessionStatus::Uploading,
            UploadSessionStatus::Assembling,
        ];
        if !self.db.transition_upload_session(
            session_id,
            &open,
            UploadSessionStatus::Cancelled,
            Some(reason),
            Utc::now(),
        )? {
            return Err(Error::invalid_state(format!(
                "Session {} is {}",
                session_id, session.status
            )));
        }
        self.db.cancel_open_chunks(session_id)?;
        self.fan_out.remove(&session_id);

        self.events.info(
            Some(tenant_id),
            "upload.cancelled",
            &format!("Upload of '{}' cancelled: {}", session.filename, reason),
            json!({ "session_id": session_id }),
        );

        if let Err(e) = self.staging.remove_session(session_id).await {
            tracing::warn!("Staging cleanup for session {} failed: {}", session_id, e);
        }
        self.get_session(tenant_id, session_id)
    }

    /// Mark open sessions past their TTL expired
    pub fn expire_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for session in self.db.list_expired_sessions(now)? {
            if self.expire(&session, now)? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Remove staging directories of terminal sessions
    pub async fn cleanup_artifacts(&self) -> Result<usize> {
        let mut removed = 0;
        for session in self.db.list_upload_sessions(&TERMINAL)? {
            if self.staging.remove_session(session.id).await? {
                removed += 1;
            }
            self.fan_out.remove(&session.id);
        }
        if removed > 0 {
            tracing::info!("Removed staging of {} finished upload sessions", removed);
        }
        Ok(removed)
    }

    /// Session that still accepts chunks at `now`
    fn live_session(&self, tenant_id: Uuid, session_id: Uuid, now: DateTime<Utc>) -> Result<UploadSession> {
        let session = self.get_session(tenant_id, session_id)?;

        if session.status == UploadSessionStatus::Expired {
            return Err(Error::SessionExpired(session_id.to_string()));
        }
        if session.status.accepts_chunks() && session.is_expired_at(now) {
            self.expire(&session, now)?;
            return Err(Error::SessionExpired(session_id.to_string()));
        }
        if !session.status.accepts_chunks() {
            return Err(Error::invalid_state(format!(
                "Session {} is {}",
                session_id, session.status
            )));
        }
        Ok(session)
    }

    fn expire(&self, session: &UploadSession, now: DateTime<Utc>) -> Result<bool> {
        if !self.db.transition_upload_session(
            session.id,
            &OPEN,
            UploadSessionStatus::Expired,
            Some("session expired"),
            now,
        )? {
            return Ok(false);
        }
        self.db.cancel_open_chunks(session.id)?;
        self.fan_out.remove(&session.id);
        self.events.info(
            Some(session.tenant_id),
            "upload.expired",
            &format!("Upload session for '{}' expired", session.filename),
            json!({ "session_id": session.id, "uploaded_chunks": session.uploaded_chunks }),
        );
        Ok(true)
    }

    /// `assembling -> failed`; returns the error for the caller to surface
    fn fail_session(&self, session: &UploadSession, error: Error) -> Error {
        let message = error.to_string();
        match self.db.transition_upload_session(
            session.id,
            &[UploadSessionStatus::Assembling],
            UploadSessionStatus::Failed,
            Some(&message),
            Utc::now(),
        ) {
            Ok(_) => self.events.error(
                Some(session.tenant_id),
                "upload.failed",
                &format!("Upload of '{}' failed: {}", session.filename, message),
                json!({ "session_id": session.id }),
            ),
            Err(e) => tracing::error!("Failed to mark session {} failed: {}", session.id, e),
        }
        self.fan_out.remove(&session.id);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StartBatchOptions;
    use crate::config::IngestConfig;
    use crate::events::DbEventLog;
    use crate::processing::{QueueManager, WorkerTier};
    use crate::providers::LocalObjectStore;
    use crate::testing;
    use crate::types::{NewBatch, NewBatchFile};
    use futures::future::join_all;
    use futures::FutureExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: IngestDb,
        batches: Arc<BatchManager>,
        uploads: ChunkedUploadManager,
        store: Arc<dyn ObjectStore>,
    }

    fn fixture_with(adjust: impl FnOnce(&mut IngestConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = testing::config(dir.path());
        adjust(&mut config);
        let db = testing::db();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(&config.storage.objects_dir).unwrap());
        let queue = Arc::new(QueueManager::new(db.clone(), config.queue.clone(), testing::events()));
        let batches = Arc::new(BatchManager::new(
            db.clone(),
            config.batch.clone(),
            WorkerTier::new(&config.workers),
            queue,
            store.clone(),
            testing::events(),
        ));
        let uploads = ChunkedUploadManager::new(
            db.clone(),
            config.uploads.clone(),
            ChunkStaging::new(&config.storage.staging_dir).unwrap(),
            store.clone(),
            batches.clone(),
            Arc::new(DbEventLog::new(db.clone())),
        );
        Fixture {
            _dir: dir,
            db,
            batches,
            uploads,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    const PAYLOAD: &[u8] = b"abcdefghijklmnopqrst";

    fn chunk(i: usize) -> Bytes {
        let end = ((i + 1) * 8).min(PAYLOAD.len());
        Bytes::copy_from_slice(&PAYLOAD[i * 8..end])
    }

    fn session_request() -> NewUploadSession {
        let mut request = NewUploadSession::new("stämmoprotokoll.pdf", PAYLOAD.len() as u64);
        request.expected_hash = Some(sha256_hex(PAYLOAD));
        request
    }

    #[test]
    fn test_session_precreates_chunk_range() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();
        assert_eq!(session.chunk_size, 8);
        assert_eq!(session.total_chunks, 3);

        let chunks = f.uploads.list_chunks(tenant, session.id).unwrap();
        let sizes: Vec<u64> = chunks.iter().map(|c| c.expected_size).collect();
        assert_eq!(sizes, vec![8, 8, 4]);

        let mut bad = session_request();
        bad.chunk_size = Some(2);
        assert!(matches!(f.uploads.create_session(tenant, bad), Err(Error::Validation(_))));
        assert!(matches!(
            f.uploads.get_session(Uuid::new_v4(), session.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_chunk_fails_then_retry_assembles() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();

        f.uploads.upload_chunk(tenant, session.id, 0, chunk(0), None).await.unwrap();

        let good_hash = sha256_hex(&chunk(1));
        let err = f
            .uploads
            .upload_chunk(tenant, session.id, 1, Bytes::from_static(b"XXXXXXXX"), Some(&good_hash))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        f.uploads.upload_chunk(tenant, session.id, 2, chunk(2), None).await.unwrap();
        let chunks = f.uploads.list_chunks(tenant, session.id).unwrap();
        assert_eq!(chunks[1].status, ChunkStatus::Failed);
        assert_eq!(chunks[1].retry_count, 1);
        assert_ne!(
            f.uploads.get_session(tenant, session.id).unwrap().status,
            UploadSessionStatus::Completed
        );

        let resume = f.uploads.resume(tenant, session.id).unwrap();
        assert_eq!(resume.completed_chunks, vec![0, 2]);
        assert_eq!(resume.missing_chunks, vec![1]);

        let outcome = f
            .uploads
            .upload_chunk(tenant, session.id, 1, chunk(1), Some(&good_hash))
            .await
            .unwrap();
        assert_eq!(outcome.session.status, UploadSessionStatus::Completed);
        assert_eq!(outcome.session.final_hash.as_deref(), Some(sha256_hex(PAYLOAD).as_str()));

        let stored = f.store.read(outcome.session.final_path.as_deref().unwrap()).await.unwrap();
        assert_eq!(stored, PAYLOAD);
        assert!(!f.uploads.staging.session_dir(session.id).exists());
    }

    #[tokio::test]
    async fn test_retry_limit_and_idempotent_reupload() {
        let f = fixture_with(|c| c.uploads.max_chunk_retries = 2);
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();
        let good_hash = sha256_hex(&chunk(0));

        let first = f.uploads.upload_chunk(tenant, session.id, 0, chunk(0), None).await.unwrap();
        assert!(!first.already_uploaded);
        let again = f.uploads.upload_chunk(tenant, session.id, 0, chunk(0), None).await.unwrap();
        assert!(again.already_uploaded);
        assert!(matches!(
            f.uploads
                .upload_chunk(tenant, session.id, 0, chunk(1), None)
                .await,
            Err(Error::Conflict(_))
        ));

        let good_hash_1 = sha256_hex(&chunk(1));
        for _ in 0..2 {
            let err = f
                .uploads
                .upload_chunk(tenant, session.id, 1, chunk(0), Some(&good_hash_1))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Integrity(_)));
        }
        let err = f
            .uploads
            .upload_chunk(tenant, session.id, 1, chunk(1), Some(&good_hash_1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryLimitExceeded(_)));

        // The session itself stays open
        let session = f.uploads.get_session(tenant, session.id).unwrap();
        assert_eq!(session.status, UploadSessionStatus::Uploading);
        assert_ne!(good_hash, good_hash_1);
    }

    #[tokio::test]
    async fn test_parallel_chunks_assemble_once() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();

        let uploads = (0..3).map(|i| {
            f.uploads
                .upload_chunk(tenant, session.id, i as u32, chunk(i), None)
        });
        let results = join_all(uploads).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let session = f.uploads.get_session(tenant, session.id).unwrap();
        assert_eq!(session.status, UploadSessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_whole_file_mismatch_fails_session() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let mut request = session_request();
        request.expected_hash = Some(sha256_hex(b"something else"));
        let session = f.uploads.create_session(tenant, request).unwrap();

        f.uploads.upload_chunk(tenant, session.id, 0, chunk(0), None).await.unwrap();
        f.uploads.upload_chunk(tenant, session.id, 1, chunk(1), None).await.unwrap();
        let err = f
            .uploads
            .upload_chunk(tenant, session.id, 2, chunk(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        let session = f.uploads.get_session(tenant, session.id).unwrap();
        assert_eq!(session.status, UploadSessionStatus::Failed);
        assert!(session.error.unwrap().contains("does not match"));
        assert!(matches!(f.uploads.resume(tenant, session.id), Err(Error::InvalidState(_))));

        // Leftovers of the failed session are cleaned up
        assert_eq!(f.uploads.cleanup_artifacts().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_resumable() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();

        let later = Utc::now() + Duration::days(2);
        assert_eq!(f.uploads.expire_sessions(later).unwrap(), 1);
        assert!(matches!(
            f.uploads.resume(tenant, session.id),
            Err(Error::SessionExpired(_))
        ));
        assert!(matches!(
            f.uploads.upload_chunk(tenant, session.id, 0, chunk(0), None).await,
            Err(Error::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_linked_session_completes_batch_file() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("chunked")).unwrap();
        let file = f
            .batches
            .add_files(tenant, batch.id, vec![NewBatchFile::new("protokoll.pdf", PAYLOAD.len() as u64)])
            .unwrap()
            .remove(0);
        f.batches
            .start_batch(tenant, batch.id, StartBatchOptions::default())
            .unwrap();

        let mut request = session_request();
        request.batch_file_id = Some(file.id);
        let session = f.uploads.create_session(tenant, request).unwrap();
        for i in 0..3 {
            f.uploads
                .upload_chunk(tenant, session.id, i as u32, chunk(i), None)
                .await
                .unwrap();
        }

        let file = f.batches.get_file(tenant, file.id).unwrap();
        assert_eq!(file.upload_status, UploadStatus::Completed);
        assert_eq!(file.content_hash.as_deref(), Some(sha256_hex(PAYLOAD).as_str()));
        assert!(file.storage_path.is_some());
    }

    #[tokio::test]
    async fn test_cancel_keeps_written_chunks() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();
        f.uploads.upload_chunk(tenant, session.id, 0, chunk(0), None).await.unwrap();

        let cancelled = f.uploads.cancel(tenant, session.id, "user request").await.unwrap();
        assert_eq!(cancelled.status, UploadSessionStatus::Cancelled);

        let chunks = f.uploads.list_chunks(tenant, session.id).unwrap();
        assert_eq!(chunks[0].status, ChunkStatus::Uploaded);
        assert_eq!(chunks[1].status, ChunkStatus::Cancelled);
        assert!(matches!(
            f.uploads.upload_chunk(tenant, session.id, 1, chunk(1), None).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_write_releases_chunk() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();

        // Abandon the upload at its first suspension point
        let pending = f
            .uploads
            .upload_chunk(tenant, session.id, 0, chunk(0), None)
            .now_or_never();
        drop(pending);

        let chunks = f.uploads.list_chunks(tenant, session.id).unwrap();
        assert_ne!(chunks[0].status, ChunkStatus::Uploading);

        let outcome = f
            .uploads
            .upload_chunk(tenant, session.id, 0, chunk(0), None)
            .await
            .unwrap();
        assert_eq!(outcome.chunk.status, ChunkStatus::Uploaded);
        let resume = f.uploads.resume(tenant, session.id).unwrap();
        assert_eq!(resume.completed_chunks, vec![0]);
    }

    #[tokio::test]
    async fn test_release_after_failed_write_keeps_retry_state() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();

        assert!(f.db.claim_upload_chunk(session.id, 1).unwrap());
        f.db.mark_chunk_failed(session.id, 1, "disk full").unwrap();
        assert!(f.db.claim_upload_chunk(session.id, 1).unwrap());
        drop(ChunkClaim::new(&f.db, session.id, 1));

        let chunks = f.uploads.list_chunks(tenant, session.id).unwrap();
        assert_eq!(chunks[1].status, ChunkStatus::Failed);
        assert_eq!(chunks[1].retry_count, 1);
    }

    #[tokio::test]
    async fn test_session_transitions_reach_event_log() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let session = f.uploads.create_session(tenant, session_request()).unwrap();
        for i in 0..3 {
            f.uploads
                .upload_chunk(tenant, session.id, i as u32, chunk(i), None)
                .await
                .unwrap();
        }

        let types: Vec<String> = f
            .db
            .list_events(tenant, 50)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        let count = |name: &str| types.iter().filter(|t| t.as_str() == name).count();
        assert_eq!(count("upload.started"), 1);
        assert_eq!(count("upload.chunk_uploaded"), 3);
        assert_eq!(count("upload.assembling"), 1);
        assert_eq!(count("upload.completed"), 1);
    }
}
