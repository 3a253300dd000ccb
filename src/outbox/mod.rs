//! # Outbox
//!
//! Idempotent publish plus claim/complete for at-least-once event delivery.
//! A pending event is unique per `(aggregate_type, aggregate_id, event_type)`
//! under the partial unique index `uq_outbox_pending`; repeated publishes of
//! a not-yet-delivered event coalesce into the existing row instead of
//! queueing unboundedly. Claims use skip-locked reads so concurrent
//! dispatchers neither block on nor double-claim each other's batches, and
//! every claim is stamped on the row in the same statement that locks it, so
//! it survives past the statement instead of evaporating when the locks
//! release. An abandoned claim becomes reclaimable once the configured claim
//! timeout lapses; delivery callbacks must still tolerate redelivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::database::upsert::{ConflictTarget, UpsertOutcome};
use crate::database::with_locked_transaction;
use crate::error::{RecoveryError, Result};

const EVENT_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, \
     processed_at, retry_count, claimed_at, claimed_by";

/// Conflict target for the pending-row uniqueness rule. Expressed as the
/// column list plus index predicate; a partial unique index has no named
/// constraint to reference.
const PENDING_CONFLICT: ConflictTarget = ConflictTarget::partial_index(
    &["aggregate_type", "aggregate_id", "event_type"],
    "processed_at IS NULL",
);

/// A durable event awaiting delivery. `processed_at IS NULL` means pending.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

/// Result of reporting a delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Still pending; `retry_count` after the increment.
    Retried { retry_count: i32 },
    /// Retry budget exhausted; row copied to the dead-letter table and
    /// terminally closed. Requires operator intervention.
    DeadLettered,
}

/// At-least-once delivery queue backed by the `outbox` table.
pub struct Outbox {
    pool: PgPool,
    config: RecoveryConfig,
    claimant: String,
}

impl Outbox {
    pub fn new(pool: PgPool, config: RecoveryConfig) -> Self {
        Self {
            pool,
            config,
            claimant: format!("outbox-{}", std::process::id()),
        }
    }

    /// Publish an event idempotently. While a matching pending row exists,
    /// repeated publishes update its payload and bump `retry_count` rather
    /// than inserting a duplicate.
    pub async fn publish(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<UpsertOutcome> {
        let (id, inserted) = sqlx::query_as::<_, (i64, bool)>(&publish_sql())
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(event_type)
            .bind(&payload)
            .fetch_one(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        let outcome = UpsertOutcome::from_row(id, inserted);
        debug!(
            aggregate_type = %aggregate_type,
            aggregate_id = %aggregate_id,
            event_type = %event_type,
            event_id = id,
            merged = outcome.is_merged(),
            "📤 Outbox publish"
        );
        Ok(outcome)
    }

    /// Claim up to `batch_size` pending events, ascending by id. The claim
    /// stamp lands in the same skip-locked statement that selects the rows,
    /// so a dispatcher polling right after this call returns sees nothing;
    /// the rows stay claimed until `complete`, `fail`, or the claim timeout.
    /// There is no cross-row ordering guarantee beyond the batch itself.
    pub async fn claim(&self, batch_size: i64) -> Result<Vec<OutboxEvent>> {
        let mut events = sqlx::query_as::<_, OutboxEvent>(&claim_sql())
            .bind(batch_size)
            .bind(self.config.claim_timeout_secs as f64)
            .bind(&self.claimant)
            .fetch_all(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        // UPDATE .. RETURNING carries no ordering guarantee.
        events.sort_by_key(|e| e.id);

        debug!(
            claimed = events.len(),
            claimant = %self.claimant,
            "📥 Outbox claim"
        );
        Ok(events)
    }

    /// Mark an event delivered.
    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox SET processed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        debug!(event_id = id, "✅ Outbox event completed");
        Ok(())
    }

    /// Report a delivery failure. The row stays pending with an incremented
    /// `retry_count` until the configured budget is exhausted, then routes to
    /// `outbox_dead_letters` in the same transaction that closes it.
    pub async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome> {
        let max_attempts = self.config.max_delivery_attempts;
        let last_error = error.to_string();

        let outcome = with_locked_transaction(&self.pool, self.config.lock_timeout(), |txn| {
            Box::pin(async move {
                let lock_sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM outbox \
                     WHERE id = $1 AND processed_at IS NULL \
                     FOR UPDATE"
                );
                let Some(event) = txn.lock_row::<OutboxEvent, _>(&lock_sql, id).await? else {
                    return Err(RecoveryError::database_query(
                        "outbox.fail",
                        format!("No pending event with id {id}"),
                    ));
                };

                let attempts = event.retry_count + 1;
                if attempts >= max_attempts {
                    sqlx::query(
                        "INSERT INTO outbox_dead_letters \
                         (outbox_id, aggregate_type, aggregate_id, event_type, payload, \
                          retry_count, last_error) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(event.id)
                    .bind(&event.aggregate_type)
                    .bind(&event.aggregate_id)
                    .bind(&event.event_type)
                    .bind(&event.payload)
                    .bind(attempts)
                    .bind(&last_error)
                    .execute(txn.executor())
                    .await
                    .map_err(RecoveryError::from)?;

                    sqlx::query(
                        "UPDATE outbox SET processed_at = NOW(), retry_count = $2 WHERE id = $1",
                    )
                    .bind(id)
                    .bind(attempts)
                    .execute(txn.executor())
                    .await
                    .map_err(RecoveryError::from)?;

                    Ok(FailOutcome::DeadLettered)
                } else {
                    // Releasing the claim makes the row immediately
                    // reclaimable instead of waiting out the claim timeout.
                    sqlx::query(
                        "UPDATE outbox \
                         SET retry_count = $2, claimed_at = NULL, claimed_by = NULL \
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(attempts)
                    .execute(txn.executor())
                    .await
                    .map_err(RecoveryError::from)?;

                    Ok(FailOutcome::Retried {
                        retry_count: attempts,
                    })
                }
            })
        })
        .await?;

        match outcome {
            FailOutcome::DeadLettered => {
                warn!(event_id = id, error = %error, "💀 Outbox event dead-lettered");
            }
            FailOutcome::Retried { retry_count } => {
                info!(
                    event_id = id,
                    retry_count, error = %error,
                    "🔁 Outbox delivery failed, will retry"
                );
            }
        }
        Ok(outcome)
    }

    /// Number of events still awaiting delivery.
    pub async fn pending_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox WHERE processed_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(RecoveryError::from)
    }
}

/// The claim statement. Locking select and claim stamp are one statement; a
/// claim taken as a bare `FOR UPDATE SKIP LOCKED` select would release with
/// the statement's implicit transaction and the next poller would claim the
/// same rows.
fn claim_sql() -> String {
    format!(
        "UPDATE outbox SET claimed_at = NOW(), claimed_by = $3 \
         WHERE id IN ( \
             SELECT id FROM outbox \
             WHERE processed_at IS NULL \
               AND (claimed_at IS NULL \
                    OR claimed_at < NOW() - make_interval(secs => $2)) \
             ORDER BY id ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED) \
         RETURNING {EVENT_COLUMNS}"
    )
}

/// The publish upsert, rendered once so tests can pin its shape.
fn publish_sql() -> String {
    format!(
        "INSERT INTO outbox (aggregate_type, aggregate_id, event_type, payload) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT {} DO UPDATE \
         SET payload = EXCLUDED.payload, retry_count = outbox.retry_count + 1 \
         RETURNING id, (xmax = 0) AS inserted",
        PENDING_CONFLICT.render()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_sql_targets_partial_index() {
        let sql = publish_sql();
        assert!(sql.contains(
            "ON CONFLICT (aggregate_type, aggregate_id, event_type) WHERE processed_at IS NULL"
        ));
        assert!(!sql.to_ascii_uppercase().contains("ON CONSTRAINT"));
    }

    #[test]
    fn test_publish_sql_merges_instead_of_duplicating() {
        let sql = publish_sql();
        assert!(sql.contains("retry_count = outbox.retry_count + 1"));
        assert!(sql.contains("payload = EXCLUDED.payload"));
    }

    #[test]
    fn test_claim_sql_stamps_claim_in_locking_statement() {
        let sql = claim_sql();
        assert!(sql.contains("SET claimed_at = NOW(), claimed_by = $3"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("claimed_at IS NULL"));
        assert!(sql.contains("make_interval(secs => $2)"));
    }

    #[test]
    fn test_fail_outcome_equality() {
        assert_eq!(
            FailOutcome::Retried { retry_count: 2 },
            FailOutcome::Retried { retry_count: 2 }
        );
        assert_ne!(
            FailOutcome::Retried { retry_count: 2 },
            FailOutcome::DeadLettered
        );
    }
}
