//! Integration tests for the circuit breaker store: cross-process
//! visibility, TTL auto-recovery, threshold auto-trips, and the incident
//! audit trail.

mod common;

use async_trait::async_trait;
use recovery_core::breaker::{AlertSink, CircuitBreakerStore, Incident, Severity};
use recovery_core::error::{RecoveryError, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Records every notification for assertions.
struct RecordingSink {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn notify(&self, incident: &Incident) -> Result<String> {
        self.seen
            .lock()
            .expect("sink mutex")
            .push(incident.circuit_breaker_name.clone());
        Ok("ack".to_string())
    }
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_trip_is_visible_from_another_replica() {
    let pool = common::setup_pool().await;
    let name = common::unique_name("costsim");

    let store = CircuitBreakerStore::new(pool.clone(), common::test_config());
    store
        .trip(&name, "manual test", "ops-1", Severity::High, None)
        .await
        .expect("trip");
    assert!(store.is_open(&name).await.expect("is_open"));

    // A second store over a fresh pool simulates another replica; the gate
    // is a row, not process state.
    let other_pool = PgPool::connect(&common::database_url())
        .await
        .expect("second pool");
    let other_store = CircuitBreakerStore::new(other_pool, common::test_config());
    assert!(other_store.is_open(&name).await.expect("is_open remote"));

    assert!(matches!(
        other_store.check(&name).await,
        Err(RecoveryError::CircuitOpen { .. })
    ));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_ttl_auto_recovery_without_reset() {
    let pool = common::setup_pool().await;
    let name = common::unique_name("costsim");
    let store = CircuitBreakerStore::new(pool, common::test_config());

    store
        .trip(
            &name,
            "drift spike",
            "ops-1",
            Severity::High,
            Some(Duration::from_secs(1)),
        )
        .await
        .expect("trip");
    assert!(store.is_open(&name).await.expect("open during ttl"));

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // No reset() call: the expired TTL reads as CLOSED.
    assert!(!store.is_open(&name).await.expect("closed after ttl"));
    store.check(&name).await.expect("check passes after ttl");

    // The next mutating call durably clears the flag.
    store.record_success(&name).await.expect("record success");
    let state = store.get(&name).await.expect("get").expect("state exists");
    assert!(!state.disabled);
    assert!(state.disabled_until.is_none());
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_consecutive_failures_auto_trip() {
    let pool = common::setup_pool().await;
    let config = common::test_config();
    let threshold = config.failure_threshold;
    let name = common::unique_name("costsim");
    let store = CircuitBreakerStore::new(pool, config);

    for _ in 0..threshold - 1 {
        let tripped = store
            .record_failure(&name, "simulation call failed")
            .await
            .expect("record failure");
        assert!(tripped.is_none());
        assert!(!store.is_open(&name).await.expect("still closed"));
    }

    let tripped = store
        .record_failure(&name, "simulation call failed")
        .await
        .expect("threshold failure");
    let incident = tripped.expect("threshold trip produces an incident");
    assert!(store.is_open(&name).await.expect("open after auto-trip"));

    let state = store.get(&name).await.expect("get").expect("state exists");
    assert_eq!(state.consecutive_failures, threshold);
    assert_eq!(state.incident_id, Some(incident.id));
    assert!(state.disabled_until.is_some(), "auto-trip uses default ttl");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_success_resets_failure_counter() {
    let pool = common::setup_pool().await;
    let name = common::unique_name("costsim");
    let store = CircuitBreakerStore::new(pool, common::test_config());

    store
        .record_failure(&name, "transient")
        .await
        .expect("failure one");
    store
        .record_failure(&name, "transient")
        .await
        .expect("failure two");
    store.record_success(&name).await.expect("success");

    let state = store.get(&name).await.expect("get").expect("state exists");
    assert_eq!(state.consecutive_failures, 0);
    assert!(!state.disabled);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_reset_clears_gate_and_incident_trail_survives() {
    let pool = common::setup_pool().await;
    let name = common::unique_name("costsim");
    let store = CircuitBreakerStore::new(pool, common::test_config());

    let incident = store
        .trip(&name, "manual maintenance", "ops-1", Severity::Medium, None)
        .await
        .expect("trip");
    store.reset(&name, "ops-2").await.expect("reset");
    assert!(!store.is_open(&name).await.expect("closed after reset"));

    // The incident remains as the durable explanation of the trip.
    let incidents = store
        .recent_incidents(&name, 10)
        .await
        .expect("recent incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].id, incident.id);
    assert_eq!(incidents[0].reason, "manual maintenance");
    assert_eq!(incidents[0].severity, "medium");
    assert!(!incidents[0].resolved);

    let resolved = store
        .resolve_incident(incident.id, "ops-2", Some("false alarm"))
        .await
        .expect("resolve");
    assert!(resolved.resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("ops-2"));
    // Causal fields untouched by resolution.
    assert_eq!(resolved.reason, "manual maintenance");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_trip_notifies_alert_sink_and_stamps_incident() {
    let pool = common::setup_pool().await;
    let name = common::unique_name("costsim");
    let sink = Arc::new(RecordingSink {
        seen: Mutex::new(Vec::new()),
    });
    let store = CircuitBreakerStore::new(pool, common::test_config())
        .with_alert_sink(sink.clone());

    let incident = store
        .trip(&name, "drift spike", "canary", Severity::Critical, None)
        .await
        .expect("trip");

    let seen = sink.seen.lock().expect("sink mutex");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], name);
    drop(seen);
    assert!(incident.alert_sent);
    assert_eq!(incident.alert_response.as_deref(), Some("ack"));
    assert!(incident.alert_sent_at.is_some());
}
