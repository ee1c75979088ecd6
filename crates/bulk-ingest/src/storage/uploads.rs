//! Chunked upload session persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::database::{
    get_enum, get_opt_ts, get_opt_uuid, get_ts, get_u32, get_u64, get_uuid, opt_ts, ts,
    IngestDb,
};
use crate::error::Result;
use crate::types::{ChunkStatus, DbEnum, UploadChunk, UploadSession, UploadSessionStatus};

fn status_list<T: DbEnum>(statuses: &[T]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of marking a claimed chunk uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMark {
    /// The chunk was no longer `uploading`
    Stale,
    /// Stored; `session_started` when this moved the session `pending -> uploading`
    Uploaded { session_started: bool },
}

impl IngestDb {
    /// Insert a session together with its full chunk range
    pub fn insert_upload_session(
        &self,
        session: &UploadSession,
        chunks: &[UploadChunk],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO upload_sessions (
                id, tenant_id, batch_file_id, filename, total_size, chunk_size, total_chunks,
                uploaded_chunks, uploaded_bytes, expected_hash, final_hash, status, staging_dir,
                final_path, error, expires_at, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19)
            "#,
            params![
                session.id.to_string(),
                session.tenant_id.to_string(),
                session.batch_file_id.map(|id| id.to_string()),
                session.filename,
                session.total_size as i64,
                session.chunk_size as i64,
                session.total_chunks as i64,
                session.uploaded_chunks as i64,
                session.uploaded_bytes as i64,
                session.expected_hash,
                session.final_hash,
                session.status.as_str(),
                session.staging_dir,
                session.final_path,
                session.error,
                ts(session.expires_at),
                ts(session.created_at),
                ts(session.updated_at),
                opt_ts(session.completed_at),
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO upload_chunks (
                    session_id, chunk_index, expected_size, actual_size, expected_hash,
                    actual_hash, status, retry_count, last_error, uploaded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.session_id.to_string(),
                    chunk.chunk_index as i64,
                    chunk.expected_size as i64,
                    chunk.actual_size.map(|v| v as i64),
                    chunk.expected_hash,
                    chunk.actual_hash,
                    chunk.status.as_str(),
                    chunk.retry_count as i64,
                    chunk.last_error,
                    opt_ts(chunk.uploaded_at),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a session by ID
    pub fn get_upload_session(&self, session_id: Uuid) -> Result<Option<UploadSession>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT * FROM upload_sessions WHERE id = ?1",
                params![session_id.to_string()],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Sessions in any of the given statuses
    pub fn list_upload_sessions(
        &self,
        statuses: &[UploadSessionStatus],
    ) -> Result<Vec<UploadSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM upload_sessions WHERE status IN ({}) ORDER BY created_at ASC",
            status_list(statuses)
        ))?;
        let sessions = stmt
            .query_map([], row_to_session)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(sessions)
    }

    /// Open sessions whose expiry has passed
    pub fn list_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM upload_sessions
            WHERE status IN ('pending', 'uploading') AND expires_at <= ?1
            ORDER BY expires_at ASC
            "#,
        )?;
        let sessions = stmt
            .query_map(params![ts(now)], row_to_session)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(sessions)
    }

    /// Non-terminal sessions tied to files of a batch
    pub fn list_open_sessions_for_batch(&self, batch_id: Uuid) -> Result<Vec<UploadSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT s.* FROM upload_sessions s
            JOIN batch_files f ON f.id = s.batch_file_id
            WHERE f.batch_id = ?1 AND s.status IN ('pending', 'uploading', 'assembling')
            "#,
        )?;
        let sessions = stmt
            .query_map(params![batch_id.to_string()], row_to_session)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(sessions)
    }

    /// Chunks of a session in ordinal order
    pub fn list_upload_chunks(&self, session_id: Uuid) -> Result<Vec<UploadChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_chunks WHERE session_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let chunks = stmt
            .query_map(params![session_id.to_string()], row_to_chunk)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(chunks)
    }

    /// Get one chunk
    pub fn get_upload_chunk(&self, session_id: Uuid, index: u32) -> Result<Option<UploadChunk>> {
        let conn = self.conn.lock();
        let chunk = conn
            .query_row(
                "SELECT * FROM upload_chunks WHERE session_id = ?1 AND chunk_index = ?2",
                params![session_id.to_string(), index as i64],
                row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    /// Claim a chunk for writing while its session accepts chunks
    pub fn claim_upload_chunk(&self, session_id: Uuid, index: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE upload_chunks SET status = 'uploading'
            WHERE session_id = ?1 AND chunk_index = ?2 AND status IN ('pending', 'failed')
              AND EXISTS (
                  SELECT 1 FROM upload_sessions s
                  WHERE s.id = ?1 AND s.status IN ('pending', 'uploading')
              )
            "#,
            params![session_id.to_string(), index as i64],
        )?;
        Ok(count == 1)
    }

    /// `uploading -> uploaded` and refresh the session counters in one transaction
    pub fn mark_chunk_uploaded(
        &self,
        session_id: Uuid,
        index: u32,
        actual_size: u64,
        actual_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ChunkMark> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let sid = session_id.to_string();

        let count = tx.execute(
            r#"
            UPDATE upload_chunks SET
                status = 'uploaded',
                actual_size = ?3,
                actual_hash = ?4,
                last_error = NULL,
                uploaded_at = ?5
            WHERE session_id = ?1 AND chunk_index = ?2 AND status = 'uploading'
            "#,
            params![sid, index as i64, actual_size as i64, actual_hash, ts(now)],
        )?;
        if count != 1 {
            tx.commit()?;
            return Ok(ChunkMark::Stale);
        }

        let was_pending: bool = tx.query_row(
            "SELECT status = 'pending' FROM upload_sessions WHERE id = ?1",
            params![sid],
            |row| row.get(0),
        )?;
        tx.execute(
            r#"
            UPDATE upload_sessions SET
                uploaded_chunks = (SELECT COUNT(*) FROM upload_chunks
                    WHERE session_id = ?1 AND status = 'uploaded'),
                uploaded_bytes = (SELECT COALESCE(SUM(actual_size), 0) FROM upload_chunks
                    WHERE session_id = ?1 AND status = 'uploaded'),
                status = CASE WHEN status = 'pending' THEN 'uploading' ELSE status END,
                updated_at = ?2
            WHERE id = ?1
            "#,
            params![sid, ts(now)],
        )?;

        tx.commit()?;
        Ok(ChunkMark::Uploaded {
            session_started: was_pending,
        })
    }

    /// `uploading -> failed`, bumping the retry counter
    pub fn mark_chunk_failed(&self, session_id: Uuid, index: u32, error: &str) -> Result<u32> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE upload_chunks SET
                status = 'failed',
                retry_count = retry_count + 1,
                last_error = ?3
            WHERE session_id = ?1 AND chunk_index = ?2 AND status = 'uploading'
            "#,
            params![session_id.to_string(), index as i64, error],
        )?;
        let retries: i64 = conn.query_row(
            "SELECT retry_count FROM upload_chunks WHERE session_id = ?1 AND chunk_index = ?2",
            params![session_id.to_string(), index as i64],
            |row| row.get(0),
        )?;
        Ok(retries as u32)
    }

    /// Put a claimed chunk back to its previous retryable state
    pub fn release_upload_chunk(&self, session_id: Uuid, index: u32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE upload_chunks SET status = CASE WHEN retry_count > 0 THEN 'failed' ELSE 'pending' END
            WHERE session_id = ?1 AND chunk_index = ?2 AND status = 'uploading'
            "#,
            params![session_id.to_string(), index as i64],
        )?;
        Ok(())
    }

    /// Cancel chunks that never made it
    pub fn cancel_open_chunks(&self, session_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE upload_chunks SET status = 'cancelled'
            WHERE session_id = ?1 AND status IN ('pending', 'uploading', 'failed')
            "#,
            params![session_id.to_string()],
        )?;
        Ok(count)
    }

    /// Compare-and-set session status
    pub fn transition_upload_session(
        &self,
        session_id: Uuid,
        from: &[UploadSessionStatus],
        to: UploadSessionStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            UPDATE upload_sessions SET
                status = ?2,
                error = COALESCE(?3, error),
                updated_at = ?4
            WHERE id = ?1 AND status IN ({})
            "#,
            status_list(from)
        );
        let count = conn.execute(
            &sql,
            params![session_id.to_string(), to.as_str(), error, ts(now)],
        )?;
        Ok(count == 1)
    }

    /// `assembling -> completed` with the final object location
    pub fn complete_upload_session(
        &self,
        session_id: Uuid,
        final_hash: &str,
        final_path: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE upload_sessions SET
                status = 'completed',
                final_hash = ?2,
                final_path = ?3,
                updated_at = ?4,
                completed_at = ?4
            WHERE id = ?1 AND status = 'assembling'
            "#,
            params![session_id.to_string(), final_hash, final_path, ts(now)],
        )?;
        Ok(count == 1)
    }
}

fn row_to_session(row: &Row) -> rusqlite::Result<UploadSession> {
    Ok(UploadSession {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        batch_file_id: get_opt_uuid(row, "batch_file_id")?,
        filename: row.get("filename")?,
        total_size: get_u64(row, "total_size")?,
        chunk_size: get_u64(row, "chunk_size")?,
        total_chunks: get_u32(row, "total_chunks")?,
        uploaded_chunks: get_u32(row, "uploaded_chunks")?,
        uploaded_bytes: get_u64(row, "uploaded_bytes")?,
        expected_hash: row.get("expected_hash")?,
        final_hash: row.get("final_hash")?,
        status: get_enum(row, "status")?,
        staging_dir: row.get("staging_dir")?,
        final_path: row.get("final_path")?,
        error: row.get("error")?,
        expires_at: get_ts(row, "expires_at")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        completed_at: get_opt_ts(row, "completed_at")?,
    })
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<UploadChunk> {
    Ok(UploadChunk {
        session_id: get_uuid(row, "session_id")?,
        chunk_index: get_u32(row, "chunk_index")?,
        expected_size: get_u64(row, "expected_size")?,
        actual_size: row.get::<_, Option<i64>>("actual_size")?.map(|v| v as u64),
        expected_hash: row.get("expected_hash")?,
        actual_hash: row.get("actual_hash")?,
        status: get_enum::<ChunkStatus>(row, "status")?,
        retry_count: get_u32(row, "retry_count")?,
        last_error: row.get("last_error")?,
        uploaded_at: get_opt_ts(row, "uploaded_at")?,
    })
}
