//! Append-only event log persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::database::{get_enum, get_opt_uuid, get_ts, ts, IngestDb};
use crate::error::{Error, Result};
use crate::events::EventRecord;
use crate::types::DbEnum;

impl IngestDb {
    /// Append one event, returning its row ID
    pub fn append_event(&self, event: &EventRecord) -> Result<i64> {
        let conn = self.conn.lock();
        let data = serde_json::to_string(&event.data)?;
        conn.execute(
            r#"
            INSERT INTO event_log (tenant_id, event_type, level, message, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.tenant_id.map(|id| id.to_string()),
                event.event_type,
                event.level.as_str(),
                event.message,
                data,
                ts(event.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest events of a tenant, newest first
    pub fn list_events(&self, tenant_id: Uuid, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM event_log WHERE tenant_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let raw: Vec<(EventRecord, String)> = stmt
            .query_map(params![tenant_id.to_string(), limit as i64], row_to_event)?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|(mut event, data)| {
                event.data = serde_json::from_str(&data).map_err(|e| {
                    Error::Internal(format!("Corrupt event data on row {}: {}", event.id, e))
                })?;
                Ok(event)
            })
            .collect()
    }

    /// Prune events older than `before`
    pub fn prune_events(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM event_log WHERE created_at < ?1",
            params![ts(before)],
        )?;
        Ok(count)
    }
}

fn row_to_event(row: &Row) -> rusqlite::Result<(EventRecord, String)> {
    let event = EventRecord {
        id: row.get("id")?,
        tenant_id: get_opt_uuid(row, "tenant_id")?,
        event_type: row.get("event_type")?,
        level: get_enum(row, "level")?,
        message: row.get("message")?,
        data: serde_json::Value::Null,
        created_at: get_ts(row, "created_at")?,
    };
    Ok((event, row.get("data")?))
}
