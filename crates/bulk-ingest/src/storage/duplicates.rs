//! Duplicate detection persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use uuid::Uuid;

use super::database::{
    get_bool, get_enum, get_opt_enum, get_opt_ts, get_opt_uuid, get_ts, get_u32, get_u64,
    get_uuid, opt_ts, ts, IngestDb,
};
use crate::error::{Error, Result};
use crate::types::{
    ComparisonMetrics, DbEnum, DetectionAlgorithm, DetectionScope, DetectionSession,
    DuplicateGroup, DuplicateRecord, GroupMember, ResolutionAction,
};

impl IngestDb {
    // ==================== Detection sessions ====================

    /// Insert a detection session
    pub fn insert_detection_session(&self, session: &DetectionSession) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO detection_sessions (
                id, tenant_id, scope_batch_id, status, files_considered, pairs_compared,
                matches_found, groups_created, errors, error, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                session.id.to_string(),
                session.tenant_id.to_string(),
                session.scope.batch_id().map(|id| id.to_string()),
                session.status.as_str(),
                session.files_considered as i64,
                session.pairs_compared as i64,
                session.matches_found as i64,
                session.groups_created as i64,
                session.errors as i64,
                session.error,
                ts(session.started_at),
                opt_ts(session.completed_at),
            ],
        )?;

        for algorithm in &session.algorithms {
            tx.execute(
                "INSERT OR IGNORE INTO detection_session_algorithms (session_id, algorithm) VALUES (?1, ?2)",
                params![session.id.to_string(), algorithm.as_str()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Write the status and counters of a session
    pub fn update_detection_session(&self, session: &DetectionSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE detection_sessions SET
                status = ?2,
                files_considered = ?3,
                pairs_compared = ?4,
                matches_found = ?5,
                groups_created = ?6,
                errors = ?7,
                error = ?8,
                completed_at = ?9
            WHERE id = ?1
            "#,
            params![
                session.id.to_string(),
                session.status.as_str(),
                session.files_considered as i64,
                session.pairs_compared as i64,
                session.matches_found as i64,
                session.groups_created as i64,
                session.errors as i64,
                session.error,
                opt_ts(session.completed_at),
            ],
        )?;
        Ok(())
    }

    /// Get a detection session by ID
    pub fn get_detection_session(&self, session_id: Uuid) -> Result<Option<DetectionSession>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT * FROM detection_sessions WHERE id = ?1",
                params![session_id.to_string()],
                row_to_detection_session,
            )
            .optional()?;

        let Some(mut session) = session else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT algorithm FROM detection_session_algorithms WHERE session_id = ?1",
        )?;
        let mut algorithms: Vec<DetectionAlgorithm> = stmt
            .query_map(params![session_id.to_string()], |row| {
                get_enum::<DetectionAlgorithm>(row, "algorithm")
            })?
            .collect::<rusqlite::Result<_>>()?;
        algorithms.sort_by_key(|a| a.priority());
        session.algorithms = algorithms;

        Ok(Some(session))
    }

    // ==================== Records ====================

    /// Insert a record unless the pair is already recorded for the tenant
    pub fn insert_duplicate_record(&self, record: &DuplicateRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let metrics = serde_json::to_string(&record.metrics)?;

        let count = conn.execute(
            r#"
            INSERT OR IGNORE INTO duplicate_records (
                id, tenant_id, session_id, file_a, file_b, algorithm, similarity, confidence,
                recommended_action, auto_resolvable, metrics, status, group_id, resolution,
                resolved_by, resolved_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                record.id.to_string(),
                record.tenant_id.to_string(),
                record.session_id.to_string(),
                record.file_a.to_string(),
                record.file_b.to_string(),
                record.algorithm.as_str(),
                record.similarity,
                record.confidence.as_str(),
                record.recommended_action.as_str(),
                record.auto_resolvable,
                metrics,
                record.status.as_str(),
                record.group_id.map(|id| id.to_string()),
                record.resolution.map(|r| r.as_str()),
                record.resolved_by,
                opt_ts(record.resolved_at),
                ts(record.created_at),
            ],
        )?;
        Ok(count == 1)
    }

    /// Pairs (smaller id first) already recorded for a tenant
    pub fn recorded_pairs(&self, tenant_id: Uuid) -> Result<HashSet<(Uuid, Uuid)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT file_a, file_b FROM duplicate_records WHERE tenant_id = ?1")?;
        let pairs = stmt
            .query_map(params![tenant_id.to_string()], |row| {
                Ok((get_uuid(row, "file_a")?, get_uuid(row, "file_b")?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(pairs)
    }

    /// Get a record by ID
    pub fn get_duplicate_record(&self, record_id: Uuid) -> Result<Option<DuplicateRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT * FROM duplicate_records WHERE id = ?1",
                params![record_id.to_string()],
                row_to_record,
            )
            .optional()?;
        record.map(finish_record).transpose()
    }

    /// Records produced by one session
    pub fn list_session_records(&self, session_id: Uuid) -> Result<Vec<DuplicateRecord>> {
        let conn = self.conn.lock();
        query_records(
            &conn,
            "SELECT * FROM duplicate_records WHERE session_id = ?1 ORDER BY file_a, file_b",
            session_id,
        )
    }

    /// Records belonging to one group
    pub fn list_group_records(&self, group_id: Uuid) -> Result<Vec<DuplicateRecord>> {
        let conn = self.conn.lock();
        query_records(
            &conn,
            "SELECT * FROM duplicate_records WHERE group_id = ?1 ORDER BY file_a, file_b",
            group_id,
        )
    }

    /// Attach records to their group
    pub fn set_record_group(&self, record_ids: &[Uuid], group_id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for id in record_ids {
            tx.execute(
                "UPDATE duplicate_records SET group_id = ?2 WHERE id = ?1",
                params![id.to_string(), group_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// `pending -> resolved`; a resolved record never changes again
    pub fn resolve_duplicate_record(
        &self,
        record_id: Uuid,
        action: ResolutionAction,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE duplicate_records SET
                status = 'resolved',
                resolution = ?2,
                resolved_by = ?3,
                resolved_at = ?4
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![record_id.to_string(), action.as_str(), actor, ts(now)],
        )?;
        Ok(count == 1)
    }

    // ==================== Groups ====================

    /// Insert a group with its members
    pub fn insert_duplicate_group(&self, group: &DuplicateGroup) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = group.id.to_string();

        tx.execute(
            r#"
            INSERT INTO duplicate_groups (
                id, tenant_id, session_id, master_file_id, total_size, strategy,
                auto_resolvable, quality_score, confidence_score, resolved, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                id,
                group.tenant_id.to_string(),
                group.session_id.to_string(),
                group.master_file_id.to_string(),
                group.total_size as i64,
                group.strategy.as_str(),
                group.auto_resolvable,
                group.quality_score,
                group.confidence_score,
                group.resolved,
                ts(group.created_at),
            ],
        )?;

        for member in &group.members {
            tx.execute(
                r#"
                INSERT INTO duplicate_group_members (group_id, file_id, is_master, quality_score, size_bytes)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    id,
                    member.file_id.to_string(),
                    member.is_master,
                    member.quality_score,
                    member.size_bytes as i64,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a group by ID
    pub fn get_duplicate_group(&self, group_id: Uuid) -> Result<Option<DuplicateGroup>> {
        let conn = self.conn.lock();
        let group = conn
            .query_row(
                "SELECT * FROM duplicate_groups WHERE id = ?1",
                params![group_id.to_string()],
                row_to_group,
            )
            .optional()?;

        match group {
            Some(mut group) => {
                group.members = load_members(&conn, group.id)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// A tenant's groups, optionally for one session, newest first
    pub fn list_duplicate_groups(
        &self,
        tenant_id: Uuid,
        session_id: Option<Uuid>,
        include_resolved: bool,
    ) -> Result<Vec<DuplicateGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM duplicate_groups
            WHERE tenant_id = ?1
              AND (?2 IS NULL OR session_id = ?2)
              AND (?3 OR resolved = 0)
            ORDER BY created_at DESC, id ASC
            "#,
        )?;
        let mut groups: Vec<DuplicateGroup> = stmt
            .query_map(
                params![
                    tenant_id.to_string(),
                    session_id.map(|id| id.to_string()),
                    include_resolved,
                ],
                row_to_group,
            )?
            .collect::<rusqlite::Result<_>>()?;

        for group in &mut groups {
            group.members = load_members(&conn, group.id)?;
        }
        Ok(groups)
    }

    /// Mark a group resolved once none of its records is pending
    pub fn close_group_if_settled(&self, group_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE duplicate_groups SET resolved = 1
            WHERE id = ?1 AND resolved = 0
              AND NOT EXISTS (
                  SELECT 1 FROM duplicate_records WHERE group_id = ?1 AND status = 'pending'
              )
            "#,
            params![group_id.to_string()],
        )?;
        Ok(count == 1)
    }
}

fn query_records(conn: &Connection, sql: &str, id: Uuid) -> Result<Vec<DuplicateRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let raw: Vec<(DuplicateRecord, String)> = stmt
        .query_map(params![id.to_string()], row_to_record)?
        .collect::<rusqlite::Result<_>>()?;
    raw.into_iter().map(finish_record).collect()
}

fn finish_record((mut record, metrics): (DuplicateRecord, String)) -> Result<DuplicateRecord> {
    record.metrics = serde_json::from_str(&metrics)
        .map_err(|e| Error::Internal(format!("Corrupt metrics on record {}: {}", record.id, e)))?;
    Ok(record)
}

fn load_members(conn: &Connection, group_id: Uuid) -> Result<Vec<GroupMember>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT * FROM duplicate_group_members WHERE group_id = ?1
        ORDER BY is_master DESC, quality_score DESC, file_id ASC
        "#,
    )?;
    let members = stmt
        .query_map(params![group_id.to_string()], |row| {
            Ok(GroupMember {
                file_id: get_uuid(row, "file_id")?,
                is_master: get_bool(row, "is_master")?,
                quality_score: row.get("quality_score")?,
                size_bytes: get_u64(row, "size_bytes")?,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(members)
}

/// Record row plus its raw metrics JSON, decoded afterwards
fn row_to_record(row: &Row) -> rusqlite::Result<(DuplicateRecord, String)> {
    let record = DuplicateRecord {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        session_id: get_uuid(row, "session_id")?,
        file_a: get_uuid(row, "file_a")?,
        file_b: get_uuid(row, "file_b")?,
        algorithm: get_enum(row, "algorithm")?,
        similarity: row.get("similarity")?,
        confidence: get_enum(row, "confidence")?,
        recommended_action: get_enum(row, "recommended_action")?,
        auto_resolvable: get_bool(row, "auto_resolvable")?,
        metrics: ComparisonMetrics::default(),
        status: get_enum(row, "status")?,
        group_id: get_opt_uuid(row, "group_id")?,
        resolution: get_opt_enum(row, "resolution")?,
        resolved_by: row.get("resolved_by")?,
        resolved_at: get_opt_ts(row, "resolved_at")?,
        created_at: get_ts(row, "created_at")?,
    };
    Ok((record, row.get("metrics")?))
}

fn row_to_group(row: &Row) -> rusqlite::Result<DuplicateGroup> {
    Ok(DuplicateGroup {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        session_id: get_uuid(row, "session_id")?,
        master_file_id: get_uuid(row, "master_file_id")?,
        members: Vec::new(),
        total_size: get_u64(row, "total_size")?,
        strategy: get_enum(row, "strategy")?,
        auto_resolvable: get_bool(row, "auto_resolvable")?,
        quality_score: row.get("quality_score")?,
        confidence_score: row.get("confidence_score")?,
        resolved: get_bool(row, "resolved")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn row_to_detection_session(row: &Row) -> rusqlite::Result<DetectionSession> {
    let scope = match get_opt_uuid(row, "scope_batch_id")? {
        Some(batch_id) => DetectionScope::Batch(batch_id),
        None => DetectionScope::Tenant,
    };
    Ok(DetectionSession {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        scope,
        status: get_enum(row, "status")?,
        algorithms: Vec::new(),
        files_considered: get_u32(row, "files_considered")?,
        pairs_compared: get_u32(row, "pairs_compared")?,
        matches_found: get_u32(row, "matches_found")?,
        groups_created: get_u32(row, "groups_created")?,
        errors: get_u32(row, "errors")?,
        error: row.get("error")?,
        started_at: get_ts(row, "started_at")?,
        completed_at: get_opt_ts(row, "completed_at")?,
    })
}
