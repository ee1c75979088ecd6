//! Sliding-window rate limiting
//!
//! Usage is counted per `(tenant, operation)` and per `(ip, operation)` over a
//! trailing window, with an independent 60-second burst sub-window checked
//! first. Rules come from configuration and may be overridden per tenant.
//! Admission is advisory: check and record are separate steps.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::{RateLimitConfig, RateLimitRule};
use crate::error::{Error, Result};
use crate::storage::{IngestDb, WindowUsage};
use crate::types::RateLimitDecision;

/// Length of the burst sub-window
pub const BURST_WINDOW_SECS: u64 = 60;

/// Sliding-window rate limiter backed by the usage table
pub struct RateLimiter {
    db: IngestDb,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(db: IngestDb, config: RateLimitConfig) -> Self {
        Self { db, config }
    }

    /// Effective rule for a tenant: override first, then the default
    pub fn rule_for(&self, tenant_id: Option<Uuid>, operation: &str) -> Result<Option<RateLimitRule>> {
        if let Some(tenant_id) = tenant_id {
            if let Some(rule) = self.db.get_rate_limit_override(tenant_id, operation)? {
                return Ok(Some(rule));
            }
        }
        Ok(self.config.rules.get(operation).copied())
    }

    /// Check admission without recording usage
    pub fn check(
        &self,
        tenant_id: Option<Uuid>,
        client_ip: Option<&str>,
        operation: &str,
    ) -> Result<RateLimitDecision> {
        self.check_at(tenant_id, client_ip, operation, Utc::now())
    }

    /// Check admission as of `now`
    pub fn check_at(
        &self,
        tenant_id: Option<Uuid>,
        client_ip: Option<&str>,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        if !self.config.enabled {
            return Ok(RateLimitDecision::unlimited(operation));
        }

        let mut decision: Option<RateLimitDecision> = None;

        if let Some(tenant_id) = tenant_id {
            if let Some(rule) = self.rule_for(Some(tenant_id), operation)? {
                let scoped = self.evaluate(&tenant_key(tenant_id), operation, &rule, now)?;
                decision = Some(scoped);
            }
        }

        if let Some(ip) = client_ip {
            if let Some(rule) = self.config.rules.get(operation) {
                let scoped = self.evaluate(&ip_key(ip), operation, rule, now)?;
                decision = Some(match decision {
                    Some(existing) => existing.stricter(scoped),
                    None => scoped,
                });
            }
        }

        Ok(decision.unwrap_or_else(|| RateLimitDecision::unlimited(operation)))
    }

    /// Record one use of `operation`
    pub fn record(&self, tenant_id: Option<Uuid>, client_ip: Option<&str>, operation: &str) -> Result<()> {
        self.record_at(tenant_id, client_ip, operation, Utc::now())
    }

    /// Record one use of `operation` at `at`
    pub fn record_at(
        &self,
        tenant_id: Option<Uuid>,
        client_ip: Option<&str>,
        operation: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if let Some(tenant_id) = tenant_id {
            self.db.record_rate_limit_usage(&tenant_key(tenant_id), operation, at)?;
        }
        if let Some(ip) = client_ip {
            self.db.record_rate_limit_usage(&ip_key(ip), operation, at)?;
        }
        Ok(())
    }

    /// Check, and on admission record the use; a denial becomes `RateLimited`
    pub fn admit(
        &self,
        tenant_id: Option<Uuid>,
        client_ip: Option<&str>,
        operation: &str,
    ) -> Result<RateLimitDecision> {
        let now = Utc::now();
        let decision = self.check_at(tenant_id, client_ip, operation, now)?;
        if !decision.allowed {
            tracing::warn!(
                "Rate limit hit for '{}' (tenant {:?}, ip {:?}), retry after {}s",
                operation,
                tenant_id,
                client_ip,
                decision.retry_after_secs
            );
            return Err(Error::RateLimited {
                operation: operation.to_string(),
                retry_after_secs: decision.retry_after_secs,
            });
        }
        self.record_at(tenant_id, client_ip, operation, now)?;
        Ok(decision)
    }

    /// Override the rule for one tenant
    pub fn set_override(&self, tenant_id: Uuid, operation: &str, rule: RateLimitRule) -> Result<()> {
        if rule.window_secs == 0 || rule.max_requests == 0 {
            return Err(Error::validation("Rate limit rule needs a positive window and limit"));
        }
        self.db.put_rate_limit_override(tenant_id, operation, &rule)?;
        tracing::info!(
            "Rate limit override for tenant {} on '{}': {}/{}s",
            tenant_id,
            operation,
            rule.max_requests,
            rule.window_secs
        );
        Ok(())
    }

    pub fn clear_override(&self, tenant_id: Uuid, operation: &str) -> Result<bool> {
        self.db.delete_rate_limit_override(tenant_id, operation)
    }

    /// Delete usage rows no window can see any more, overrides included
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let longest = self
            .config
            .rules
            .values()
            .map(|rule| rule.window_secs)
            .max()
            .unwrap_or(0)
            .max(self.db.longest_override_window()?.unwrap_or(0))
            .max(BURST_WINDOW_SECS);
        let removed = self
            .db
            .delete_rate_limit_usage_before(now - secs(longest))?;
        if removed > 0 {
            tracing::debug!("Rate limit cleanup removed {} usage rows", removed);
        }
        Ok(removed)
    }

    fn evaluate(
        &self,
        scope_key: &str,
        operation: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let burst = match rule.burst_limit {
            Some(limit) => {
                let usage = self
                    .db
                    .rate_limit_usage(scope_key, operation, now - secs(BURST_WINDOW_SECS))?;
                let decision = window_decision(operation, limit, BURST_WINDOW_SECS, usage, now, true);
                if !decision.allowed {
                    return Ok(decision);
                }
                Some(decision)
            }
            None => None,
        };

        let usage = self
            .db
            .rate_limit_usage(scope_key, operation, now - secs(rule.window_secs))?;
        let main = window_decision(operation, rule.max_requests, rule.window_secs, usage, now, false);

        Ok(match burst {
            Some(burst) if main.allowed => main.stricter(burst),
            _ => main,
        })
    }
}

fn tenant_key(tenant_id: Uuid) -> String {
    format!("tenant:{}", tenant_id)
}

fn ip_key(ip: &str) -> String {
    format!("ip:{}", ip)
}

fn secs(value: u64) -> Duration {
    Duration::seconds(value as i64)
}

/// Decide one window from its usage
fn window_decision(
    operation: &str,
    limit: u32,
    window_secs: u64,
    usage: WindowUsage,
    now: DateTime<Utc>,
    burst: bool,
) -> RateLimitDecision {
    let reset_at = usage.oldest.map(|oldest| oldest + secs(window_secs));
    let allowed = usage.count < limit;

    let retry_after_secs = if allowed {
        0
    } else {
        let wait_ms = reset_at
            .map(|reset| (reset - now).num_milliseconds())
            .unwrap_or(window_secs as i64 * 1000);
        // Round up so the hint never undershoots
        ((wait_ms.max(0) as u64 + 999) / 1000).max(1)
    };

    RateLimitDecision {
        allowed,
        operation: operation.to_string(),
        limit,
        remaining: limit.saturating_sub(usage.count),
        reset_at,
        retry_after_secs,
        burst,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter() -> RateLimiter {
        RateLimiter::new(IngestDb::in_memory().unwrap(), RateLimitConfig::default())
    }

    #[test]
    fn test_window_admits_limit_then_denies_then_recovers() {
        let limiter = limiter();
        let tenant = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        // create_batch: 10 per hour, no burst rule
        for i in 0..10 {
            let at = start + Duration::minutes(i);
            let decision = limiter.check_at(Some(tenant), None, "create_batch", at).unwrap();
            assert!(decision.allowed, "call {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 10 - i as u32);
            limiter.record_at(Some(tenant), None, "create_batch", at).unwrap();
        }

        let at = start + Duration::minutes(30);
        let denied = limiter.check_at(Some(tenant), None, "create_batch", at).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, Some(start + Duration::hours(1)));
        assert_eq!(denied.retry_after_secs, 30 * 60);

        let later = start + Duration::hours(1) + Duration::seconds(1);
        assert!(limiter.check_at(Some(tenant), None, "create_batch", later).unwrap().allowed);
    }

    #[test]
    fn test_burst_window_checked_first() {
        let limiter = limiter();
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        // start_detection: 20 per hour, 5 per minute
        for _ in 0..5 {
            limiter.record_at(Some(tenant), None, "start_detection", now).unwrap();
        }
        let denied = limiter.check_at(Some(tenant), None, "start_detection", now).unwrap();
        assert!(!denied.allowed);
        assert!(denied.burst);
        assert_eq!(denied.limit, 5);

        let after_burst = now + Duration::seconds(61);
        let decision = limiter
            .check_at(Some(tenant), None, "start_detection", after_burst)
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[test]
    fn test_ip_scope_more_restrictive_wins() {
        let limiter = limiter();
        let now = Utc::now();
        let ip = "10.0.0.7";

        // Ten other tenants behind the same address
        for _ in 0..10 {
            limiter
                .record_at(Some(Uuid::new_v4()), Some(ip), "create_batch", now)
                .unwrap();
        }

        let fresh_tenant = Uuid::new_v4();
        assert!(limiter.check_at(Some(fresh_tenant), None, "create_batch", now).unwrap().allowed);
        assert!(!limiter.check_at(Some(fresh_tenant), Some(ip), "create_batch", now).unwrap().allowed);
    }

    #[test]
    fn test_tenant_override_and_unknown_operation() {
        let limiter = limiter();
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        limiter
            .set_override(tenant, "create_batch", RateLimitRule::new(60, 1, None))
            .unwrap();
        limiter.record_at(Some(tenant), None, "create_batch", now).unwrap();
        assert!(!limiter.check_at(Some(tenant), None, "create_batch", now).unwrap().allowed);

        assert!(limiter.clear_override(tenant, "create_batch").unwrap());
        assert!(limiter.check_at(Some(tenant), None, "create_batch", now).unwrap().allowed);

        let unknown = limiter.check_at(Some(tenant), None, "export", now).unwrap();
        assert!(unknown.allowed);
    }

    #[test]
    fn test_admit_returns_rate_limited_error() {
        let limiter = limiter();
        let tenant = Uuid::new_v4();
        limiter
            .set_override(tenant, "create_batch", RateLimitRule::new(3600, 2, None))
            .unwrap();

        limiter.admit(Some(tenant), None, "create_batch").unwrap();
        limiter.admit(Some(tenant), None, "create_batch").unwrap();
        let err = limiter.admit(Some(tenant), None, "create_batch").unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_secs, .. } if retry_after_secs > 0));
    }

    #[test]
    fn test_cleanup_keeps_live_rows() {
        let limiter = limiter();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        limiter
            .record_at(Some(tenant), None, "create_batch", now - Duration::hours(2))
            .unwrap();
        limiter.record_at(Some(tenant), None, "create_batch", now).unwrap();

        assert_eq!(limiter.cleanup(now).unwrap(), 1);
        let decision = limiter.check_at(Some(tenant), None, "create_batch", now).unwrap();
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn test_cleanup_honours_longer_override_window() {
        let limiter = limiter();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        limiter
            .set_override(tenant, "create_batch", RateLimitRule::new(86400, 1, None))
            .unwrap();
        limiter
            .record_at(Some(tenant), None, "create_batch", now - Duration::hours(2))
            .unwrap();
        assert!(!limiter.check_at(Some(tenant), None, "create_batch", now).unwrap().allowed);

        assert_eq!(limiter.cleanup(now).unwrap(), 0);
        assert!(!limiter.check_at(Some(tenant), None, "create_batch", now).unwrap().allowed);
    }
}
