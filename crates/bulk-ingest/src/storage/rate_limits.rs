//! Rate limit usage and override persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::database::{ts, IngestDb};
use crate::config::RateLimitRule;
use crate::error::{Error, Result};

/// Usage seen inside one trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub count: u32,
    /// Oldest event still inside the window
    pub oldest: Option<DateTime<Utc>>,
}

impl IngestDb {
    /// Count events strictly after `since`
    pub fn rate_limit_usage(
        &self,
        scope_key: &str,
        operation: &str,
        since: DateTime<Utc>,
    ) -> Result<WindowUsage> {
        let conn = self.conn.lock();
        let (count, oldest): (i64, Option<String>) = conn.query_row(
            r#"
            SELECT COUNT(*), MIN(occurred_at) FROM rate_limit_usage
            WHERE scope_key = ?1 AND operation = ?2 AND occurred_at > ?3
            "#,
            params![scope_key, operation, ts(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let oldest = oldest
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| Error::Internal(format!("Bad usage timestamp {}: {}", raw, e)))
            })
            .transpose()?;

        Ok(WindowUsage {
            count: count as u32,
            oldest,
        })
    }

    /// Append one usage event
    pub fn record_rate_limit_usage(
        &self,
        scope_key: &str,
        operation: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rate_limit_usage (scope_key, operation, occurred_at) VALUES (?1, ?2, ?3)",
            params![scope_key, operation, ts(at)],
        )?;
        Ok(())
    }

    /// Drop usage rows older than `before`
    pub fn delete_rate_limit_usage_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM rate_limit_usage WHERE occurred_at <= ?1",
            params![ts(before)],
        )?;
        Ok(count)
    }

    /// Longest window among all tenant overrides
    pub fn longest_override_window(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let longest: Option<i64> = conn.query_row(
            "SELECT MAX(window_secs) FROM rate_limit_overrides",
            [],
            |row| row.get(0),
        )?;
        Ok(longest.map(|w| w.max(0) as u64))
    }

    /// Tenant override for one operation
    pub fn get_rate_limit_override(
        &self,
        tenant_id: Uuid,
        operation: &str,
    ) -> Result<Option<RateLimitRule>> {
        let conn = self.conn.lock();
        let rule = conn
            .query_row(
                r#"
                SELECT window_secs, max_requests, burst_limit FROM rate_limit_overrides
                WHERE tenant_id = ?1 AND operation = ?2
                "#,
                params![tenant_id.to_string(), operation],
                |row| {
                    Ok(RateLimitRule {
                        window_secs: row.get::<_, i64>(0)? as u64,
                        max_requests: row.get::<_, i64>(1)? as u32,
                        burst_limit: row.get::<_, Option<i64>>(2)?.map(|b| b as u32),
                    })
                },
            )
            .optional()?;
        Ok(rule)
    }

    /// Create or replace a tenant override
    pub fn put_rate_limit_override(
        &self,
        tenant_id: Uuid,
        operation: &str,
        rule: &RateLimitRule,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO rate_limit_overrides (tenant_id, operation, window_secs, max_requests, burst_limit)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tenant_id, operation) DO UPDATE SET
                window_secs = excluded.window_secs,
                max_requests = excluded.max_requests,
                burst_limit = excluded.burst_limit
            "#,
            params![
                tenant_id.to_string(),
                operation,
                rule.window_secs as i64,
                rule.max_requests as i64,
                rule.burst_limit.map(|b| b as i64),
            ],
        )?;
        Ok(())
    }

    /// Remove a tenant override
    pub fn delete_rate_limit_override(&self, tenant_id: Uuid, operation: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM rate_limit_overrides WHERE tenant_id = ?1 AND operation = ?2",
            params![tenant_id.to_string(), operation],
        )?;
        Ok(count == 1)
    }
}
