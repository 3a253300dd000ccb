//! # Leader Election
//!
//! Advisory-lock wrapper ensuring a scheduled callback runs on at most one
//! replica at a time. The lock is session-scoped and bound to one pinned
//! connection for exactly the callback's duration, the same one-connection
//! discipline as [`crate::database::locked_transaction`]. Crash safety is
//! structural: if the owning connection dies, Postgres releases the lock; no
//! heartbeats. Callbacks must still treat partial execution as a first-class
//! outcome, since an externally killed leader may have done half its work.

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::{RecoveryError, Result};

/// Holds a session-scoped advisory lock on one dedicated connection.
///
/// [`release`](Self::release) unlocks and returns the connection to the
/// pool. Dropping an unreleased guard closes the connection instead: the
/// session dies, Postgres releases the lock, and a still-locked connection
/// never re-enters the pool where it would poison later acquirers.
pub struct AdvisoryLockGuard {
    conn: Option<PoolConnection<Postgres>>,
    lock_id: i64,
}

impl AdvisoryLockGuard {
    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Unlock and hand the connection back to the pool.
    pub async fn release(mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(RecoveryError::from)?;

        if !released {
            // The session did not hold the lock; nothing leaked, but it
            // indicates a double release somewhere.
            warn!(lock_id = self.lock_id, "pg_advisory_unlock reported no lock held");
        }
        debug!(lock_id = self.lock_id, "🔓 Advisory lock released");
        Ok(())
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                lock_id = self.lock_id,
                "Advisory lock guard dropped without release; closing its connection"
            );
            // Detach from the pool and drop: the session closes and the
            // lock releases with it.
            drop(conn.detach());
        }
    }
}

/// Advisory-lock based leader election over a shared Postgres instance.
pub struct LeaderElection {
    pool: PgPool,
}

impl LeaderElection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run `f` while holding the advisory lock `lock_id`, blocking until the
    /// current holder releases it. The lock is released on every exit path
    /// before the connection returns to the pool; used for scheduled-job
    /// exclusivity where miss-and-wait is acceptable.
    pub async fn with_lock<T, F, Fut>(&self, lock_id: i64, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conn = self.pool.acquire().await.map_err(RecoveryError::from)?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_id)
            .execute(&mut *conn)
            .await
            .map_err(RecoveryError::from)?;

        debug!(lock_id, "🔒 Advisory lock acquired (blocking)");
        let guard = AdvisoryLockGuard {
            conn: Some(conn),
            lock_id,
        };

        // A panic in f unwinds through the guard, which closes the session.
        let result = f().await;
        let released = guard.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(release_err)) => Err(release_err),
        }
    }

    /// Non-blocking acquire for nonessential best-effort jobs. Returns
    /// `None` immediately when another replica holds the lock.
    pub async fn try_acquire(&self, lock_id: i64) -> Result<Option<AdvisoryLockGuard>> {
        let mut conn = self.pool.acquire().await.map_err(RecoveryError::from)?;

        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(RecoveryError::from)?;

        if acquired {
            info!(lock_id, "🔒 Advisory lock acquired (try)");
            Ok(Some(AdvisoryLockGuard {
                conn: Some(conn),
                lock_id,
            }))
        } else {
            debug!(lock_id, "Advisory lock busy, not acquired");
            Ok(None)
        }
    }

    /// Whether any session currently holds `lock_id`. For health and status
    /// checks only; the answer can be stale by the time it is read.
    pub async fn is_held(&self, lock_id: i64) -> Result<bool> {
        // 64-bit advisory keys appear in pg_locks split across the
        // classid/objid halves with objsubid = 1.
        let sql = "SELECT EXISTS ( \
             SELECT 1 FROM pg_locks \
             WHERE locktype = 'advisory' \
               AND objsubid = 1 \
               AND ((classid::bigint << 32) | objid::bigint) = $1)";
        sqlx::query_scalar::<_, bool>(sql)
            .bind(lock_id)
            .fetch_one(&self.pool)
            .await
            .map_err(RecoveryError::from)
    }
}
