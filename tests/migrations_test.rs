//! Integration test for the migration runner's rebuild serialization.

mod common;

use recovery_core::database::DatabaseMigrations;
use recovery_core::leader::LeaderElection;

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_rebuild_advisory_lock_released_after_run() {
    let pool = common::setup_pool().await;
    let election = LeaderElection::new(pool.clone());

    // setup_pool already ran the migrations; the rebuild key must be free.
    assert!(!election
        .is_held(DatabaseMigrations::REBUILD_LOCK_KEY)
        .await
        .expect("is_held"));

    // A repeat run must release the key on the same session that took it;
    // a key left held by a pooled connection would stall every later run.
    DatabaseMigrations::run_all(&pool)
        .await
        .expect("re-run migrations");

    assert!(!election
        .is_held(DatabaseMigrations::REBUILD_LOCK_KEY)
        .await
        .expect("is_held after re-run"));
}
