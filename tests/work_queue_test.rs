//! Integration tests for the work queue: priority-merging enqueue and
//! skip-locked claiming.

mod common;

use recovery_core::database::{SqlFunctionExecutor, UpsertOutcome};
use recovery_core::outbox::FailOutcome;
use recovery_core::work_queue::WorkQueue;

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_enqueue_merges_and_escalates_priority() {
    let pool = common::setup_pool().await;
    let queue = WorkQueue::new(pool.clone(), common::test_config());
    let candidate_id = common::unique_suffix();

    let first = queue
        .enqueue(candidate_id, Some("key-1"), 5, "rescore")
        .await
        .expect("first enqueue");
    assert!(matches!(first, UpsertOutcome::Inserted(_)));

    // Lower priority does not demote; retry_count still bumps.
    let merged_low = queue
        .enqueue(candidate_id, None, 1, "rescore")
        .await
        .expect("low-priority enqueue");
    assert_eq!(merged_low, UpsertOutcome::Merged(first.id()));

    // Higher priority escalates the pending row.
    let merged_high = queue
        .enqueue(candidate_id, None, 9, "rescore")
        .await
        .expect("high-priority enqueue");
    assert_eq!(merged_high, UpsertOutcome::Merged(first.id()));

    let items = queue.claim(1000).await.expect("claim");
    let matching: Vec<_> = items
        .iter()
        .filter(|i| i.candidate_id == candidate_id)
        .collect();
    assert_eq!(matching.len(), 1, "no duplicate pending work per candidate");
    assert_eq!(matching[0].priority, 9);
    assert_eq!(matching[0].retry_count, 2);
    // The original key survives calls that omitted one.
    assert_eq!(matching[0].idempotency_key.as_deref(), Some("key-1"));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_claim_orders_by_priority_then_id() {
    let pool = common::setup_pool().await;
    let queue = WorkQueue::new(pool.clone(), common::test_config());

    let low = common::unique_suffix();
    let high = common::unique_suffix();
    queue
        .enqueue(low, None, 1, "rescore")
        .await
        .expect("enqueue low");
    queue
        .enqueue(high, None, 10, "rescore")
        .await
        .expect("enqueue high");

    let items = queue.claim(1000).await.expect("claim");
    let pos_high = items.iter().position(|i| i.candidate_id == high);
    let pos_low = items.iter().position(|i| i.candidate_id == low);
    let (pos_high, pos_low) = (
        pos_high.expect("high item claimed"),
        pos_low.expect("low item claimed"),
    );
    assert!(pos_high < pos_low, "higher priority claims first");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_complete_then_reenqueue_starts_fresh() {
    let pool = common::setup_pool().await;
    let queue = WorkQueue::new(pool.clone(), common::test_config());
    let candidate_id = common::unique_suffix();

    let first = queue
        .enqueue(candidate_id, None, 5, "rescore")
        .await
        .expect("enqueue");
    queue.complete(first.id()).await.expect("complete");

    let second = queue
        .enqueue(candidate_id, None, 2, "rescore")
        .await
        .expect("re-enqueue");
    assert!(matches!(second, UpsertOutcome::Inserted(_)));
    assert_ne!(second.id(), first.id());
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_fail_dead_letters_after_budget() {
    let pool = common::setup_pool().await;
    let config = common::test_config();
    let max_attempts = config.max_delivery_attempts;
    let queue = WorkQueue::new(pool.clone(), config);
    let candidate_id = common::unique_suffix();

    let outcome = queue
        .enqueue(candidate_id, None, 1, "rescore")
        .await
        .expect("enqueue");
    let id = outcome.id();

    for _ in 1..max_attempts {
        let fail = queue.fail(id, "worker crashed").await.expect("fail");
        assert!(matches!(fail, FailOutcome::Retried { .. }));
    }
    let fail = queue.fail(id, "worker crashed").await.expect("final fail");
    assert_eq!(fail, FailOutcome::DeadLettered);

    let dead: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM work_queue_dead_letters WHERE work_queue_id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .expect("count dead letters");
    assert_eq!(dead, 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_claimed_item_invisible_to_second_worker_until_timeout() {
    let pool = common::setup_pool().await;
    let mut config = common::test_config();
    config.claim_timeout_secs = 1;
    let first = WorkQueue::new(pool.clone(), config.clone());
    let second = WorkQueue::new(pool.clone(), config);
    let candidate_id = common::unique_suffix();

    let outcome = first
        .enqueue(candidate_id, None, 5, "rescore")
        .await
        .expect("enqueue");
    let id = outcome.id();

    let claimed = first.claim(1000).await.expect("first claim");
    assert!(claimed.iter().any(|i| i.id == id));

    let overlap = second.claim(1000).await.expect("second claim");
    assert!(overlap.iter().all(|i| i.id != id));

    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let reclaimed = second.claim(1000).await.expect("reclaim");
    assert!(reclaimed.iter().any(|i| i.id == id));

    // A failed attempt releases the claim without waiting out the timeout.
    let fail = second.fail(id, "worker crashed").await.expect("fail");
    assert!(matches!(fail, FailOutcome::Retried { .. }));
    let retried = first.claim(1000).await.expect("claim after fail");
    assert!(retried.iter().any(|i| i.id == id));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL instance (set DATABASE_URL)"]
async fn test_server_side_function_parity() {
    let pool = common::setup_pool().await;
    let queue = WorkQueue::new(pool.clone(), common::test_config());
    let executor = SqlFunctionExecutor::new(pool.clone());
    let candidate_id = common::unique_suffix();

    let row = executor
        .enqueue_work(candidate_id, Some("key-7"), 3, "rescore")
        .await
        .expect("enqueue via function");
    assert!(row.inserted);

    let merged = queue
        .enqueue(candidate_id, None, 8, "rescore")
        .await
        .expect("enqueue via crate");
    assert_eq!(merged, UpsertOutcome::Merged(row.id));

    let items = queue.claim(1000).await.expect("claim");
    let item = items
        .iter()
        .find(|i| i.candidate_id == candidate_id)
        .expect("item claimed");
    assert_eq!(item.priority, 8);
}
