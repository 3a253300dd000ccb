#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Recovery Core
//!
//! Recovery and consistency substrate for stateless service replicas that
//! coordinate through a shared PostgreSQL store. There are no in-process
//! locks anywhere in the correctness argument; every mutual-exclusion
//! guarantee is a database row lock or a session-scoped advisory lock.
//!
//! ## Components
//!
//! Dependency order, leaves first:
//!
//! 1. [`database::locked_transaction`] - one physical connection owns a
//!    locking transaction from `FOR UPDATE` to commit, making the
//!    lock-then-write-on-another-connection hang unrepresentable.
//! 2. [`breaker`] - per-named-resource health gate persisted as a row, with
//!    TTL auto-recovery and an append-only incident audit trail.
//! 3. [`outbox`] - idempotent publish + claim/complete for at-least-once
//!    event delivery, deduplicated by a partial unique index while pending.
//! 4. [`work_queue`] - priority-merging idempotent enqueue, structurally the
//!    outbox with a per-candidate uniqueness key.
//! 5. [`leader`] - advisory-lock leader election so singleton scheduled jobs
//!    run on at most one replica per tick.
//!
//! ## Control Flow
//!
//! A worker runtime asks the breaker store whether a resource is healthy
//! before risking an operation and records the outcome afterward; background
//! dispatchers claim batches from the outbox and work queue and mark
//! completion or failure; periodic jobs wrap themselves in leader election
//! so one replica executes them per tick.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use recovery_core::breaker::CircuitBreakerStore;
//! use recovery_core::config::RecoveryConfig;
//! use recovery_core::database::DatabaseConnection;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RecoveryConfig::from_env()?;
//! let db = DatabaseConnection::new(&config).await?;
//!
//! let breakers = CircuitBreakerStore::new(db.pool().clone(), config);
//! if breakers.is_open("costsim_v2").await? {
//!     // skip the protected operation this tick
//! }
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod database;
pub mod error;
pub mod leader;
pub mod logging;
pub mod outbox;
pub mod work_queue;

pub use breaker::{AlertSink, CircuitBreakerState, CircuitBreakerStore, Incident, Severity};
pub use config::RecoveryConfig;
pub use database::{
    with_locked_transaction, ConflictTarget, DatabaseConnection, DatabaseMigrations,
    LockedTransaction, SqlFunctionExecutor, UpsertOutcome,
};
pub use error::{RecoveryError, Result};
pub use leader::{AdvisoryLockGuard, LeaderElection};
pub use outbox::{FailOutcome, Outbox, OutboxEvent};
pub use work_queue::{WorkQueue, WorkQueueItem};
