//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging cross-replica
//! coordination: breaker trips, claim batches, and leader handoffs.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call from every replica and every test; only the first call wins,
/// and an already-installed global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level.clone()));

        // Production emits JSON lines for log aggregation; everywhere else
        // gets a human-readable console layer.
        let fmt_layer = if use_json_output(&environment) {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(fmt_layer);

        // Use try_init to avoid panic if a global subscriber already exists
        // (embedding applications usually install their own).
        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            environment = %environment,
            log_level = %log_level,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("RECOVERY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Whether logs should be emitted as JSON lines for aggregation.
fn use_json_output(environment: &str) -> bool {
    matches!(environment, "production" | "staging")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_json_output_selection() {
        assert!(use_json_output("production"));
        assert!(use_json_output("staging"));
        assert!(!use_json_output("development"));
        assert!(!use_json_output("test"));
    }
}
