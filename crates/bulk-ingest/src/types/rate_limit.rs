//! Rate limiter decision type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of an admission check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub operation: String,
    /// Limit of the window that decided the outcome
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted request leaves the deciding window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Seconds until a denied call may succeed, 0 when allowed
    pub retry_after_secs: u64,
    /// The burst sub-window made the decision
    pub burst: bool,
}

impl RateLimitDecision {
    /// Decision for operations without a rule
    pub fn unlimited(operation: &str) -> Self {
        Self {
            allowed: true,
            operation: operation.to_string(),
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_at: None,
            retry_after_secs: 0,
            burst: false,
        }
    }

    /// The stricter of two decisions: a denial beats an admission, otherwise
    /// the one with less quota left
    pub fn stricter(self, other: Self) -> Self {
        match (self.allowed, other.allowed) {
            (true, false) => other,
            (false, true) => self,
            (false, false) => {
                if other.retry_after_secs > self.retry_after_secs {
                    other
                } else {
                    self
                }
            }
            (true, true) => {
                if other.remaining < self.remaining {
                    other
                } else {
                    self
                }
            }
        }
    }
}
