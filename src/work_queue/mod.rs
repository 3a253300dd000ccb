//! # Work Queue
//!
//! Priority-merging idempotent work queue, structurally the outbox's twin
//! with a different uniqueness key: at most one pending item per candidate,
//! enforced by the partial unique index `uq_work_queue_candidate_pending`.
//! Re-enqueueing a pending candidate escalates its priority to the maximum
//! seen but never forks duplicate pending work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::database::upsert::{ConflictTarget, UpsertOutcome};
use crate::database::with_locked_transaction;
use crate::error::{RecoveryError, Result};
use crate::outbox::FailOutcome;

const ITEM_COLUMNS: &str = "id, candidate_id, idempotency_key, priority, method, \
     retry_count, processed_at, claimed_at, claimed_by";

const PENDING_CONFLICT: ConflictTarget =
    ConflictTarget::partial_index(&["candidate_id"], "processed_at IS NULL");

/// A unit of queued work for one candidate. `processed_at IS NULL` means
/// pending; priority is a scheduling hint, not a strict ordering guarantee.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkQueueItem {
    pub id: i64,
    pub candidate_id: i64,
    pub idempotency_key: Option<String>,
    pub priority: i32,
    pub method: String,
    pub retry_count: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

/// Idempotent work queue backed by the `work_queue` table.
pub struct WorkQueue {
    pool: PgPool,
    config: RecoveryConfig,
    claimant: String,
}

impl WorkQueue {
    pub fn new(pool: PgPool, config: RecoveryConfig) -> Self {
        Self {
            pool,
            config,
            claimant: format!("work-queue-{}", std::process::id()),
        }
    }

    /// Enqueue work for a candidate. While a pending item exists the call
    /// merges: priority becomes `max(existing, new)`, `retry_count` bumps,
    /// and an existing idempotency key survives a call that omits one.
    pub async fn enqueue(
        &self,
        candidate_id: i64,
        idempotency_key: Option<&str>,
        priority: i32,
        method: &str,
    ) -> Result<UpsertOutcome> {
        let (id, inserted) = sqlx::query_as::<_, (i64, bool)>(&enqueue_sql())
            .bind(candidate_id)
            .bind(idempotency_key)
            .bind(priority)
            .bind(method)
            .fetch_one(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        let outcome = UpsertOutcome::from_row(id, inserted);
        debug!(
            candidate_id,
            priority,
            method = %method,
            item_id = id,
            merged = outcome.is_merged(),
            "📤 Work enqueued"
        );
        Ok(outcome)
    }

    /// Claim up to `limit` pending items, highest priority first, ascending
    /// id within a priority. The claim stamp lands in the same skip-locked
    /// statement that selects the items; claimed items stay invisible to
    /// other workers until `complete`, `fail`, or the claim timeout.
    pub async fn claim(&self, limit: i64) -> Result<Vec<WorkQueueItem>> {
        let mut items = sqlx::query_as::<_, WorkQueueItem>(&claim_sql())
            .bind(limit)
            .bind(self.config.claim_timeout_secs as f64)
            .bind(&self.claimant)
            .fetch_all(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        // UPDATE .. RETURNING carries no ordering guarantee.
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        debug!(
            claimed = items.len(),
            claimant = %self.claimant,
            "📥 Work queue claim"
        );
        Ok(items)
    }

    /// Mark an item done.
    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE work_queue SET processed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(RecoveryError::from)?;

        debug!(item_id = id, "✅ Work item completed");
        Ok(())
    }

    /// Report a failed execution; dead-letters once the retry budget is
    /// exhausted, in the same transaction that closes the row.
    pub async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome> {
        let max_attempts = self.config.max_delivery_attempts;
        let last_error = error.to_string();

        let outcome = with_locked_transaction(&self.pool, self.config.lock_timeout(), |txn| {
            Box::pin(async move {
                let lock_sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM work_queue \
                     WHERE id = $1 AND processed_at IS NULL \
                     FOR UPDATE"
                );
                let Some(item) = txn.lock_row::<WorkQueueItem, _>(&lock_sql, id).await? else {
                    return Err(RecoveryError::database_query(
                        "work_queue.fail",
                        format!("No pending item with id {id}"),
                    ));
                };

                let attempts = item.retry_count + 1;
                if attempts >= max_attempts {
                    sqlx::query(
                        "INSERT INTO work_queue_dead_letters \
                         (work_queue_id, candidate_id, idempotency_key, priority, method, \
                          retry_count, last_error) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(item.id)
                    .bind(item.candidate_id)
                    .bind(&item.idempotency_key)
                    .bind(item.priority)
                    .bind(&item.method)
                    .bind(attempts)
                    .bind(&last_error)
                    .execute(txn.executor())
                    .await
                    .map_err(RecoveryError::from)?;

                    sqlx::query(
                        "UPDATE work_queue SET processed_at = NOW(), retry_count = $2 \
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(attempts)
                    .execute(txn.executor())
                    .await
                    .map_err(RecoveryError::from)?;

                    Ok(FailOutcome::DeadLettered)
                } else {
                    // Releasing the claim makes the item immediately
                    // reclaimable instead of waiting out the claim timeout.
                    sqlx::query(
                        "UPDATE work_queue \
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
                warn!(item_id = id, error = %error, "💀 Work item dead-lettered");
            }
            FailOutcome::Retried { retry_count } => {
                info!(
                    item_id = id,
                    retry_count, error = %error,
                    "🔁 Work item failed, will retry"
                );
            }
        }
        Ok(outcome)
    }

    /// Number of items still pending.
    pub async fn pending_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM work_queue WHERE processed_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(RecoveryError::from)
    }
}

/// The claim statement; same durable-claim shape as the outbox, with the
/// priority scan order.
fn claim_sql() -> String {
    format!(
        "UPDATE work_queue SET claimed_at = NOW(), claimed_by = $3 \
         WHERE id IN ( \
             SELECT id FROM work_queue \
             WHERE processed_at IS NULL \
               AND (claimed_at IS NULL \
                    OR claimed_at < NOW() - make_interval(secs => $2)) \
             ORDER BY priority DESC, id ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED) \
         RETURNING {ITEM_COLUMNS}"
    )
}

/// The enqueue upsert, rendered once so tests can pin its shape.
fn enqueue_sql() -> String {
    format!(
        "INSERT INTO work_queue (candidate_id, idempotency_key, priority, method) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT {} DO UPDATE \
         SET priority = GREATEST(work_queue.priority, EXCLUDED.priority), \
             retry_count = work_queue.retry_count + 1, \
             idempotency_key = COALESCE(EXCLUDED.idempotency_key, work_queue.idempotency_key) \
         RETURNING id, (xmax = 0) AS inserted",
        PENDING_CONFLICT.render()
    )
}
