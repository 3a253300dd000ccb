//! # Connection-Pinned Locking Transactions
//!
//! Pooled ORMs can return a connection to the pool as soon as a transaction
//! commits, letting a *different* pooled connection issue the follow-up write
//! against a row whose lock the first connection still holds. The result is a
//! hang indistinguishable from a deadlock. [`LockedTransaction`] makes that
//! bug class unrepresentable: the locking read and every subsequent statement
//! run on the one physical connection owned by the transaction, and the only
//! way in is [`with_locked_transaction`], which commits on success and rolls
//! back on any error raised inside the scope.

use crate::error::{RecoveryError, Result};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use std::time::Duration;

/// A transaction that exclusively owns one physical database connection for
/// its entire scope. sqlx pins a [`Transaction`] to a single pooled
/// connection structurally; there is no API here (or in sqlx) to run a later
/// statement on a different connection while the scope is live.
pub struct LockedTransaction {
    txn: Transaction<'static, Postgres>,
}

impl LockedTransaction {
    /// Begin a transaction on a dedicated pooled connection with a bounded
    /// lock wait. A blocked `FOR UPDATE` surfaces as a retryable
    /// [`RecoveryError::LockTimeout`] once `lock_timeout` elapses.
    async fn begin(pool: &PgPool, lock_timeout: Duration) -> Result<Self> {
        let mut txn = pool.begin().await?;

        // SET LOCAL takes no bind parameters; the value comes from config,
        // never from callers.
        let millis = lock_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = '{millis}ms'"))
            .execute(&mut *txn)
            .await?;

        Ok(Self { txn })
    }

    /// Issue a locking read (`SELECT ... FOR UPDATE`) for the row identified
    /// by `key` on this transaction's pinned connection. The lock is held
    /// until the enclosing scope commits or rolls back.
    pub async fn lock_row<T, K>(&mut self, sql: &str, key: K) -> Result<Option<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
        K: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send,
    {
        assert_locking_statement(sql);

        let row = sqlx::query_as::<_, T>(sql)
            .bind(key)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(RecoveryError::from)?;

        Ok(row)
    }

    /// The pinned connection, for the writes that must follow a locking read.
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut *self.txn
    }

    async fn commit(self) -> Result<()> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.txn.rollback().await?;
        Ok(())
    }
}

/// `lock_row` refuses statements that do not actually take a row lock.
fn assert_locking_statement(sql: &str) {
    assert!(
        sql.to_ascii_uppercase().contains("FOR UPDATE"),
        "lock_row requires a SELECT ... FOR UPDATE statement"
    );
}

/// Run `f` inside a [`LockedTransaction`]: one dedicated connection, commit
/// on `Ok`, rollback on `Err` - including errors raised by business logic
/// after a lock was taken. The connection returns to the pool only after the
/// transaction has finished either way.
pub async fn with_locked_transaction<T, F>(
    pool: &PgPool,
    lock_timeout: Duration,
    f: F,
) -> Result<T>
where
    F: for<'t> FnOnce(&'t mut LockedTransaction) -> BoxFuture<'t, Result<T>>,
{
    let mut txn = LockedTransaction::begin(pool, lock_timeout).await?;

    match f(&mut txn).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(
                    error = %rollback_err,
                    "Rollback failed after locked transaction error"
                );
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_locking_statements() {
        assert_locking_statement("SELECT id FROM outbox WHERE id = $1 FOR UPDATE");
        assert_locking_statement("select id from outbox where id = $1 for update skip locked");
    }

    #[test]
    #[should_panic(expected = "FOR UPDATE")]
    fn test_rejects_plain_select() {
        assert_locking_statement("SELECT id FROM outbox WHERE id = $1");
    }
}
