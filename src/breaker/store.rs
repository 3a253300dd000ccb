//! # Circuit Breaker Store
//!
//! Per-named-resource health gate persisted in `costsim_cb_state`. The gate
//! is a database row rather than an in-memory flag because correctness must
//! hold across replicas, not just threads: a tripped breaker stays tripped
//! for its TTL no matter how many processes independently observe health
//! afterward. Every mutation runs inside a connection-pinned locked
//! transaction, and every trip commits atomically with the incident row that
//! explains it.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::breaker::{AlertSink, CircuitBreakerState, Incident, NewIncident, Severity};
use crate::config::RecoveryConfig;
use crate::database::upsert::ConflictTarget;
use crate::database::{with_locked_transaction, LockedTransaction};
use crate::error::{RecoveryError, Result};

const STATE_COLUMNS: &str = "id, name, disabled, disabled_by, disabled_reason, disabled_until, \
     incident_id, consecutive_failures, last_failure_at, created_at, updated_at";

const INCIDENT_COLUMNS: &str = "id, circuit_breaker_name, timestamp, reason, severity, \
     drift_score, sample_count, details, resolved, resolved_at, resolved_by, resolution_notes, \
     alert_sent, alert_sent_at, alert_response";

/// `name` carries a full unique index, so the seed upsert targets the plain
/// column list.
const SEED_CONFLICT: ConflictTarget = ConflictTarget::columns(&["name"]);

/// Actor recorded on trips triggered by the consecutive-failure threshold.
const AUTO_TRIP_ACTOR: &str = "recovery-core:auto-trip";

/// DB-backed circuit breaker store. Constructed with an injected pool and
/// config; there are no process-wide singletons, so two stores pointed at the
/// same database observe each other's trips immediately.
pub struct CircuitBreakerStore {
    pool: PgPool,
    config: RecoveryConfig,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl CircuitBreakerStore {
    pub fn new(pool: PgPool, config: RecoveryConfig) -> Self {
        Self {
            pool,
            config,
            alert_sink: None,
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Open the gate for `name`: lock (seeding if needed) the state row,
    /// write the incident, flip the flag, all in one locked transaction.
    /// `ttl = None` trips until an explicit [`reset`](Self::reset).
    pub async fn trip(
        &self,
        name: &str,
        reason: &str,
        actor: &str,
        severity: Severity,
        ttl: Option<Duration>,
    ) -> Result<Incident> {
        let disabled_until = match ttl {
            Some(d) => Some(checked_deadline(d)?),
            None => None,
        };
        let incident = NewIncident::new(reason, severity);
        // Owned copies move into the transaction future.
        let gate = name.to_string();
        let tripped_by = actor.to_string();

        let written = with_locked_transaction(&self.pool, self.config.lock_timeout(), |txn| {
            Box::pin(async move {
                let state = lock_or_seed(txn, &gate).await?;
                trip_locked(txn, &state, &tripped_by, disabled_until, &incident, None).await
            })
        })
        .await?;

        warn!(
            breaker = %name,
            reason = %reason,
            actor = %actor,
            severity = %severity,
            disabled_until = ?disabled_until,
            incident_id = written.id,
            "🔴 Circuit breaker tripped"
        );

        Ok(self.send_alert(written).await)
    }

    /// Close the gate for `name` and zero its failure counter.
    pub async fn reset(&self, name: &str, actor: &str) -> Result<()> {
        let gate = name.to_string();
        with_locked_transaction(&self.pool, self.config.lock_timeout(), |txn| {
            Box::pin(async move {
                let Some(state) = lock_state(txn, &gate).await? else {
                    warn!(breaker = %gate, "Reset requested for unknown breaker");
                    return Ok(());
                };
                clear_locked(txn, &state.name).await
            })
        })
        .await?;

        info!(breaker = %name, actor = %actor, "🟢 Circuit breaker reset");
        Ok(())
    }

    /// Read-only health probe. An expired `disabled_until` reads as CLOSED;
    /// the next mutating call clears the flag durably. Unknown breakers read
    /// as CLOSED.
    pub async fn is_open(&self, name: &str) -> Result<bool> {
        let state = self.get(name).await?;
        Ok(state.map(|s| s.is_open_at(Utc::now())).unwrap_or(false))
    }

    /// Guard form of [`is_open`](Self::is_open) with fail-closed semantics:
    /// an open breaker is `CircuitOpen`, and a store error becomes
    /// `BreakerUnavailable` so "cannot verify" is never treated as healthy.
    pub async fn check(&self, name: &str) -> Result<()> {
        match self.is_open(name).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(RecoveryError::circuit_open(name)),
            Err(err) => Err(RecoveryError::breaker_unavailable(name, err.to_string())),
        }
    }

    /// Record one failure against `name`. Reaching the configured
    /// consecutive-failure threshold trips the breaker in the same locked
    /// transaction, with the default TTL. Returns the incident when this
    /// call was the one that tripped.
    pub async fn record_failure(&self, name: &str, reason: &str) -> Result<Option<Incident>> {
        let threshold = self.config.failure_threshold;
        let default_until = checked_deadline(self.config.default_trip_ttl())?;

        let gate = name.to_string();
        let failure_reason = reason.to_string();

        let tripped = with_locked_transaction(&self.pool, self.config.lock_timeout(), |txn| {
            Box::pin(async move {
                let mut state = lock_or_seed(txn, &gate).await?;

                // Durably clear a trip whose TTL has lapsed before counting.
                if state.ttl_expired_at(Utc::now()) {
                    clear_locked(txn, &gate).await?;
                    state.disabled = false;
                    state.consecutive_failures = 0;
                }

                let failures = state.consecutive_failures + 1;

                if failures >= threshold && !state.is_open_at(Utc::now()) {
                    let incident = NewIncident::new(
                        format!("{failure_reason} ({failures} consecutive failures)"),
                        Severity::High,
                    );
                    let written = trip_locked(
                        txn,
                        &state,
                        AUTO_TRIP_ACTOR,
                        Some(default_until),
                        &incident,
                        Some(failures),
                    )
                    .await?;
                    return Ok(Some(written));
                }

                sqlx::query(
                    "UPDATE costsim_cb_state \
                     SET consecutive_failures = $2, last_failure_at = NOW(), updated_at = NOW() \
                     WHERE name = $1",
                )
                .bind(&gate)
                .bind(failures)
                .execute(txn.executor())
                .await
                .map_err(RecoveryError::from)?;

                Ok(None)
            })
        })
        .await?;

        match tripped {
            Some(incident) => {
                error!(
                    breaker = %name,
                    threshold = threshold,
                    incident_id = incident.id,
                    "🔴 Circuit breaker auto-tripped on consecutive failures"
                );
                Ok(Some(self.send_alert(incident).await))
            }
            None => {
                debug!(breaker = %name, "Failure recorded below threshold");
                Ok(None)
            }
        }
    }

    /// Record a success: zero the failure counter and durably clear an
    /// expired trip.
    pub async fn record_success(&self, name: &str) -> Result<()> {
        let gate = name.to_string();
        with_locked_transaction(&self.pool, self.config.lock_timeout(), |txn| {
            Box::pin(async move {
                let state = lock_or_seed(txn, &gate).await?;

                if state.ttl_expired_at(Utc::now()) {
                    clear_locked(txn, &gate).await?;
                    return Ok(());
                }

                sqlx::query(
                    "UPDATE costsim_cb_state \
                     SET consecutive_failures = 0, updated_at = NOW() \
                     WHERE name = $1",
                )
                .bind(&state.name)
                .execute(txn.executor())
                .await
                .map_err(RecoveryError::from)?;
                Ok(())
            })
        })
        .await
    }

    /// Update only the resolution fields of an incident; the causal fields
    /// are immutable once written.
    pub async fn resolve_incident(
        &self,
        incident_id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<Incident> {
        let sql = format!(
            "UPDATE costsim_cb_incidents \
             SET resolved = TRUE, resolved_at = NOW(), resolved_by = $2, resolution_notes = $3 \
             WHERE id = $1 \
             RETURNING {INCIDENT_COLUMNS}"
        );
        let incident = sqlx::query_as::<_, Incident>(&sql)
            .bind(incident_id)
            .bind(resolved_by)
            .bind(notes)
            .fetch_one(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        info!(
            incident_id = incident.id,
            resolved_by = %resolved_by,
            "📝 Incident resolved"
        );
        Ok(incident)
    }

    /// Current state row for `name`, if it has been seeded.
    pub async fn get(&self, name: &str) -> Result<Option<CircuitBreakerState>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM costsim_cb_state WHERE name = $1");
        sqlx::query_as::<_, CircuitBreakerState>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(RecoveryError::from)
    }

    /// Most recent incidents for `name`, newest first.
    pub async fn recent_incidents(&self, name: &str, limit: i64) -> Result<Vec<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM costsim_cb_incidents \
             WHERE circuit_breaker_name = $1 \
             ORDER BY timestamp DESC, id DESC \
             LIMIT $2"
        );
        sqlx::query_as::<_, Incident>(&sql)
            .bind(name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(RecoveryError::from)
    }

    /// Deliver the alert for a freshly committed incident and stamp the
    /// alert fields. Runs after commit; failure is logged, never propagated.
    async fn send_alert(&self, incident: Incident) -> Incident {
        let Some(sink) = &self.alert_sink else {
            return incident;
        };

        match sink.notify(&incident).await {
            Ok(response) => {
                let sql = format!(
                    "UPDATE costsim_cb_incidents \
                     SET alert_sent = TRUE, alert_sent_at = NOW(), alert_response = $2 \
                     WHERE id = $1 \
                     RETURNING {INCIDENT_COLUMNS}"
                );
                match sqlx::query_as::<_, Incident>(&sql)
                    .bind(incident.id)
                    .bind(&response)
                    .fetch_one(&self.pool)
                    .await
                {
                    Ok(updated) => updated,
                    Err(err) => {
                        warn!(
                            incident_id = incident.id,
                            error = %err,
                            "Alert sent but alert fields could not be recorded"
                        );
                        incident
                    }
                }
            }
            Err(err) => {
                warn!(
                    incident_id = incident.id,
                    error = %err,
                    "Alert delivery failed; incident remains unalerted"
                );
                incident
            }
        }
    }
}

/// Locking read of the state row on the transaction's pinned connection.
async fn lock_state(
    txn: &mut LockedTransaction,
    name: &str,
) -> Result<Option<CircuitBreakerState>> {
    let sql =
        format!("SELECT {STATE_COLUMNS} FROM costsim_cb_state WHERE name = $1 FOR UPDATE");
    txn.lock_row::<CircuitBreakerState, _>(&sql, name).await
}

/// Lock the state row, seeding it first when the breaker has never been
/// seen. The seed upsert targets the unique column list, so concurrent
/// seeders collapse to one row.
async fn lock_or_seed(txn: &mut LockedTransaction, name: &str) -> Result<CircuitBreakerState> {
    if let Some(state) = lock_state(txn, name).await? {
        return Ok(state);
    }

    let seed_sql = format!(
        "INSERT INTO costsim_cb_state (name) VALUES ($1) ON CONFLICT {} DO NOTHING",
        SEED_CONFLICT.render()
    );
    sqlx::query(&seed_sql)
        .bind(name)
        .execute(txn.executor())
        .await
        .map_err(RecoveryError::from)?;

    lock_state(txn, name)
        .await?
        .ok_or_else(|| RecoveryError::internal(format!("Failed to seed breaker row for {name}")))
}

/// Write the incident and flip the gate on the already-locked row. Caller
/// holds the row lock; the audit trail can never disagree with the gate.
async fn trip_locked(
    txn: &mut LockedTransaction,
    state: &CircuitBreakerState,
    actor: &str,
    disabled_until: Option<DateTime<Utc>>,
    incident: &NewIncident,
    consecutive_failures: Option<i32>,
) -> Result<Incident> {
    let insert_sql = format!(
        "INSERT INTO costsim_cb_incidents \
         (circuit_breaker_name, reason, severity, drift_score, sample_count, details) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {INCIDENT_COLUMNS}"
    );
    let written = sqlx::query_as::<_, Incident>(&insert_sql)
        .bind(&state.name)
        .bind(&incident.reason)
        .bind(incident.severity.as_str())
        .bind(incident.drift_score)
        .bind(incident.sample_count)
        .bind(&incident.details)
        .fetch_one(txn.executor())
        .await
        .map_err(RecoveryError::from)?;

    sqlx::query(
        "UPDATE costsim_cb_state \
         SET disabled = TRUE, disabled_by = $2, disabled_reason = $3, disabled_until = $4, \
             incident_id = $5, \
             consecutive_failures = COALESCE($6, consecutive_failures), \
             last_failure_at = NOW(), updated_at = NOW() \
         WHERE name = $1",
    )
    .bind(&state.name)
    .bind(actor)
    .bind(&incident.reason)
    .bind(disabled_until)
    .bind(written.id)
    .bind(consecutive_failures)
    .execute(txn.executor())
    .await
    .map_err(RecoveryError::from)?;

    Ok(written)
}

/// Clear the gate and counter on the already-locked row.
async fn clear_locked(txn: &mut LockedTransaction, name: &str) -> Result<()> {
    sqlx::query(
        "UPDATE costsim_cb_state \
         SET disabled = FALSE, disabled_by = NULL, disabled_reason = NULL, \
             disabled_until = NULL, consecutive_failures = 0, updated_at = NOW() \
         WHERE name = $1",
    )
    .bind(name)
    .execute(txn.executor())
    .await
    .map_err(RecoveryError::from)?;
    Ok(())
}

/// Convert a std TTL into an absolute deadline, rejecting out-of-range values.
fn checked_deadline(ttl: Duration) -> Result<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(ttl)
        .map_err(|e| RecoveryError::configuration("trip_ttl", e.to_string()))?;
    Ok(Utc::now() + delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_deadline_is_in_the_future() {
        let deadline = checked_deadline(Duration::from_secs(60)).expect("valid ttl");
        assert!(deadline > Utc::now());
    }

    #[test]
    fn test_seed_conflict_targets_column_list() {
        assert_eq!(SEED_CONFLICT.render(), "(name)");
    }
}
