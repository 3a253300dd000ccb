//! # Substrate Error Types
//!
//! Structured error handling for the recovery substrate using thiserror
//! instead of `Box<dyn Error>` patterns. Lock-wait timeouts are surfaced as a
//! distinct retryable variant so callers can apply bounded retry with backoff.

use thiserror::Error;

/// Errors produced by the recovery and consistency substrate.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    /// A `FOR UPDATE` or advisory-lock wait exceeded the statement timeout.
    /// Always retryable; callers must bound their retries.
    #[error("Lock wait timed out during {operation}")]
    LockTimeout { operation: String },

    #[error("Circuit breaker is open for resource: {name}")]
    CircuitOpen { name: String },

    /// The breaker store could not be reached. "Cannot verify" is not
    /// evidence of health; callers must deny the protected operation.
    #[error("Circuit breaker store unavailable for {name}: {message}")]
    BreakerUnavailable { name: String, message: String },

    #[error("Row {id} in {table} exhausted its retry budget and was dead-lettered")]
    DeadLettered { table: String, id: i64 },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Operation timed out: {operation} after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Connection pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("Internal substrate error: {message}")]
    Internal { message: String },
}

impl RecoveryError {
    pub fn database_connection(message: impl Into<String>) -> Self {
        Self::DatabaseConnection {
            message: message.into(),
        }
    }

    pub fn database_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn lock_timeout(operation: impl Into<String>) -> Self {
        Self::LockTimeout {
            operation: operation.into(),
        }
    }

    pub fn circuit_open(name: impl Into<String>) -> Self {
        Self::CircuitOpen { name: name.into() }
    }

    pub fn breaker_unavailable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BreakerUnavailable {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn dead_lettered(table: impl Into<String>, id: i64) -> Self {
        Self::DeadLettered {
            table: table.into(),
            id,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation (with backoff and a
    /// bounded attempt count).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. }
        )
    }
}

/// Postgres SQLSTATE for `lock_not_available`, raised when a lock wait
/// exceeds `lock_timeout`.
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

impl From<sqlx::Error> for RecoveryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RecoveryError::database_query("query", "No rows found"),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some(SQLSTATE_LOCK_NOT_AVAILABLE) {
                    RecoveryError::lock_timeout("row lock")
                } else {
                    RecoveryError::database_query("database", db_err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => RecoveryError::timeout("database_pool", 30),
            sqlx::Error::PoolClosed => RecoveryError::pool_exhausted("Database pool is closed"),
            sqlx::Error::Configuration(config_err) => {
                RecoveryError::configuration("database", config_err.to_string())
            }
            _ => RecoveryError::database_connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RecoveryError {
    fn from(err: serde_json::Error) -> Self {
        RecoveryError::serialization(err.to_string())
    }
}

/// Result type alias for substrate operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let db_err = RecoveryError::database_connection("Connection failed");
        assert!(matches!(db_err, RecoveryError::DatabaseConnection { .. }));

        let open_err = RecoveryError::circuit_open("costsim_v2");
        assert!(matches!(open_err, RecoveryError::CircuitOpen { .. }));

        let dl_err = RecoveryError::dead_lettered("outbox", 42);
        assert!(matches!(dl_err, RecoveryError::DeadLettered { id: 42, .. }));
    }

    #[test]
    fn test_retryability() {
        assert!(RecoveryError::lock_timeout("trip").is_retryable());
        assert!(RecoveryError::timeout("claim", 30).is_retryable());
        assert!(RecoveryError::pool_exhausted("closed").is_retryable());
        assert!(!RecoveryError::circuit_open("costsim_v2").is_retryable());
        assert!(!RecoveryError::breaker_unavailable("costsim_v2", "down").is_retryable());
    }

    #[test]
    fn test_sqlx_conversions() {
        let timeout_err: RecoveryError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(timeout_err, RecoveryError::Timeout { .. }));

        let closed_err: RecoveryError = sqlx::Error::PoolClosed.into();
        assert!(matches!(closed_err, RecoveryError::PoolExhausted { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = RecoveryError::circuit_open("costsim_v2");
        let display = format!("{err}");
        assert!(display.contains("Circuit breaker is open"));
        assert!(display.contains("costsim_v2"));

        let err = RecoveryError::lock_timeout("trip");
        assert!(format!("{err}").contains("Lock wait timed out"));
    }
}
