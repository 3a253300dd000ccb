use crate::error::{RecoveryError, Result};
use std::time::Duration;

/// Substrate configuration: failure thresholds, default trip TTLs, and retry
/// budgets. Built with `Default` and overridden from the environment.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub database_url: String,
    /// Consecutive failures before `record_failure` auto-trips a breaker.
    pub failure_threshold: i32,
    /// Default `disabled_until` horizon for trips that do not specify a TTL.
    pub default_trip_ttl_secs: u64,
    /// Statement-level bound on lock waits inside a locked transaction.
    pub lock_timeout_ms: u64,
    /// Delivery attempts before an outbox/work-queue row is dead-lettered.
    pub max_delivery_attempts: i32,
    pub claim_batch_size: i64,
    /// Seconds before an unfinished claim is considered abandoned and the
    /// row becomes claimable by another dispatcher.
    pub claim_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/recovery_development".to_string(),
            failure_threshold: 5,
            default_trip_ttl_secs: 300,
            lock_timeout_ms: 5000,
            max_delivery_attempts: 10,
            claim_batch_size: 100,
            claim_timeout_secs: 300,
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(threshold) = std::env::var("RECOVERY_FAILURE_THRESHOLD") {
            config.failure_threshold = threshold.parse().map_err(|e| {
                RecoveryError::configuration("failure_threshold", format!("{e}"))
            })?;
        }

        if let Ok(ttl) = std::env::var("RECOVERY_DEFAULT_TRIP_TTL_SECS") {
            config.default_trip_ttl_secs = ttl.parse().map_err(|e| {
                RecoveryError::configuration("default_trip_ttl_secs", format!("{e}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("RECOVERY_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = timeout.parse().map_err(|e| {
                RecoveryError::configuration("lock_timeout_ms", format!("{e}"))
            })?;
        }

        if let Ok(attempts) = std::env::var("RECOVERY_MAX_DELIVERY_ATTEMPTS") {
            config.max_delivery_attempts = attempts.parse().map_err(|e| {
                RecoveryError::configuration("max_delivery_attempts", format!("{e}"))
            })?;
        }

        if let Ok(batch) = std::env::var("RECOVERY_CLAIM_BATCH_SIZE") {
            config.claim_batch_size = batch.parse().map_err(|e| {
                RecoveryError::configuration("claim_batch_size", format!("{e}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("RECOVERY_CLAIM_TIMEOUT_SECS") {
            config.claim_timeout_secs = timeout.parse().map_err(|e| {
                RecoveryError::configuration("claim_timeout_secs", format!("{e}"))
            })?;
        }

        Ok(config)
    }

    pub fn default_trip_ttl(&self) -> Duration {
        Duration::from_secs(self.default_trip_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.default_trip_ttl_secs, 300);
        assert_eq!(config.max_delivery_attempts, 10);
        assert_eq!(config.lock_timeout(), Duration::from_millis(5000));
        assert_eq!(config.claim_timeout(), Duration::from_secs(300));
    }

    // Single test so parallel test threads never race on process env.
    #[test]
    fn test_from_env() {
        std::env::set_var("RECOVERY_FAILURE_THRESHOLD", "3");
        std::env::set_var("RECOVERY_MAX_DELIVERY_ATTEMPTS", "7");
        let config = RecoveryConfig::from_env().expect("config should parse");
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.max_delivery_attempts, 7);
        std::env::remove_var("RECOVERY_FAILURE_THRESHOLD");
        std::env::remove_var("RECOVERY_MAX_DELIVERY_ATTEMPTS");

        std::env::set_var("RECOVERY_LOCK_TIMEOUT_MS", "not-a-number");
        let result = RecoveryConfig::from_env();
        assert!(matches!(result, Err(RecoveryError::Configuration { .. })));
        std::env::remove_var("RECOVERY_LOCK_TIMEOUT_MS");
    }
}
