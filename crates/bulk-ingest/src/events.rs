//! Structured event logging
//!
//! Every state transition emits an event through [`EventLogger`]. The
//! database-backed logger appends to the event log and mirrors each event to
//! `tracing`; a failed append is reported but never fails the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::IngestDb;
use crate::types::db_enum;

db_enum! {
    pub enum EventLevel {
        Debug => "debug",
        Info => "info",
        Warning => "warning",
        Error => "error",
    }
}

/// One persisted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    pub event_type: String,
    pub level: EventLevel,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Sink for structured audit events
pub trait EventLogger: Send + Sync {
    /// Record an event; implementations swallow their own failures
    fn log(
        &self,
        tenant_id: Option<Uuid>,
        event_type: &str,
        level: EventLevel,
        message: &str,
        data: Value,
    );

    fn info(&self, tenant_id: Option<Uuid>, event_type: &str, message: &str, data: Value) {
        self.log(tenant_id, event_type, EventLevel::Info, message, data);
    }

    fn warn(&self, tenant_id: Option<Uuid>, event_type: &str, message: &str, data: Value) {
        self.log(tenant_id, event_type, EventLevel::Warning, message, data);
    }

    fn error(&self, tenant_id: Option<Uuid>, event_type: &str, message: &str, data: Value) {
        self.log(tenant_id, event_type, EventLevel::Error, message, data);
    }
}

/// Event log stored in the ingest database
pub struct DbEventLog {
    db: IngestDb,
}

impl DbEventLog {
    pub fn new(db: IngestDb) -> Self {
        Self { db }
    }
}

impl EventLogger for DbEventLog {
    fn log(
        &self,
        tenant_id: Option<Uuid>,
        event_type: &str,
        level: EventLevel,
        message: &str,
        data: Value,
    ) {
        let tenant = tenant_id.map(|t| t.to_string()).unwrap_or_default();
        match level {
            EventLevel::Debug => tracing::debug!(tenant = %tenant, event = event_type, "{}", message),
            EventLevel::Info => tracing::info!(tenant = %tenant, event = event_type, "{}", message),
            EventLevel::Warning => tracing::warn!(tenant = %tenant, event = event_type, "{}", message),
            EventLevel::Error => tracing::error!(tenant = %tenant, event = event_type, "{}", message),
        }

        let record = EventRecord {
            id: 0,
            tenant_id,
            event_type: event_type.to_string(),
            level,
            message: message.to_string(),
            data,
            created_at: Utc::now(),
        };

        if let Err(e) = self.db.append_event(&record) {
            tracing::error!("Failed to append event '{}' to event log: {}", event_type, e);
        }
    }
}

/// Logger that only forwards to `tracing`
pub struct TracingEventLog;

impl EventLogger for TracingEventLog {
    fn log(
        &self,
        tenant_id: Option<Uuid>,
        event_type: &str,
        level: EventLevel,
        message: &str,
        _data: Value,
    ) {
        let tenant = tenant_id.map(|t| t.to_string()).unwrap_or_default();
        match level {
            EventLevel::Debug => tracing::debug!(tenant = %tenant, event = event_type, "{}", message),
            EventLevel::Info => tracing::info!(tenant = %tenant, event = event_type, "{}", message),
            EventLevel::Warning => tracing::warn!(tenant = %tenant, event = event_type, "{}", message),
            EventLevel::Error => tracing::error!(tenant = %tenant, event = event_type, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_db_event_log_appends() {
        let db = IngestDb::in_memory().unwrap();
        let log = DbEventLog::new(db.clone());
        let tenant = Uuid::new_v4();

        log.info(Some(tenant), "batch.created", "Batch 1 created", json!({"batch_number": 1}));
        log.warn(Some(tenant), "batch.file_failed", "File failed", json!({"attempt": 2}));
        log.info(Some(Uuid::new_v4()), "batch.created", "other tenant", json!({}));

        let events = db.list_events(tenant, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "batch.file_failed");
        assert_eq!(events[0].level, EventLevel::Warning);
        assert_eq!(events[1].data["batch_number"], 1);
    }
}
