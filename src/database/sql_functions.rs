//! # SQL Function Integration
//!
//! Typed wrappers for the server-side upsert functions shipped in the
//! migrations. Other services in the platform reach the outbox and work
//! queue through these functions rather than linking this crate, so the
//! merge semantics live in exactly one place per table: the function body,
//! written against the partial unique index with a column-list conflict
//! target.
//!
//! - `publish_outbox(aggregate_type, aggregate_id, event_type, payload)`
//! - `enqueue_work(candidate_id, idempotency_key, priority, method)`
//!
//! Both return `(id, inserted)` so callers can tell an insert from a merge.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Result row of the server-side upsert functions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UpsertRow {
    pub id: i64,
    /// True when the call inserted a fresh row; false when it merged into an
    /// existing pending row.
    pub inserted: bool,
}

/// Executes the substrate's PostgreSQL functions with typed results.
#[derive(Clone)]
pub struct SqlFunctionExecutor {
    pool: PgPool,
}

impl SqlFunctionExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Call `publish_outbox`, the server-side counterpart of
    /// [`crate::outbox::Outbox::publish`].
    pub async fn publish_outbox(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<UpsertRow, sqlx::Error> {
        let sql = "SELECT id, inserted FROM publish_outbox($1, $2, $3, $4)";
        sqlx::query_as::<_, UpsertRow>(sql)
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(event_type)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
    }

    /// Call `enqueue_work`, the server-side counterpart of
    /// [`crate::work_queue::WorkQueue::enqueue`].
    pub async fn enqueue_work(
        &self,
        candidate_id: i64,
        idempotency_key: Option<&str>,
        priority: i32,
        method: &str,
    ) -> Result<UpsertRow, sqlx::Error> {
        let sql = "SELECT id, inserted FROM enqueue_work($1, $2, $3, $4)";
        sqlx::query_as::<_, UpsertRow>(sql)
            .bind(candidate_id)
            .bind(idempotency_key)
            .bind(priority)
            .bind(method)
            .fetch_one(&self.pool)
            .await
    }
}
