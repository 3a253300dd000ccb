use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row per named breaker; the sole mutual-exclusion unit for that
/// resource. Maps to `costsim_cb_state`. All mutations go through the store's
/// locked transactions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CircuitBreakerState {
    pub id: i64,
    pub name: String,
    pub disabled: bool,
    pub disabled_by: Option<String>,
    pub disabled_reason: Option<String>,
    pub disabled_until: Option<DateTime<Utc>>,
    pub incident_id: Option<i64>,
    pub consecutive_failures: i32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerState {
    /// Lazy TTL evaluation: a tripped breaker whose `disabled_until` has
    /// passed reads as CLOSED. The row itself is cleared durably by the next
    /// mutating call, not by this read.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        if !self.disabled {
            return false;
        }
        match self.disabled_until {
            Some(until) => until > now,
            // No TTL: open until an explicit reset.
            None => true,
        }
    }

    /// Whether the disabled flag is stale and should be cleared by the next
    /// mutating call.
    pub fn ttl_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.disabled && !self.is_open_at(now)
    }
}
