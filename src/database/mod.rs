//! # Database Layer
//!
//! SQLx-backed database layer for the recovery substrate.
//!
//! ## Key Components
//!
//! - [`connection`] - Connection management and pooling
//! - [`migrations`] - Schema migration system with concurrency control
//! - [`locked_transaction`] - Connection-pinned locking transactions
//! - [`upsert`] - Conflict targets for partial-unique-index upserts
//! - [`sql_functions`] - Wrappers for the server-side upsert functions
//!
//! Every mutual-exclusion guarantee in this crate is a database-level row
//! lock or session-scoped advisory lock; there is no in-memory mutex in any
//! correctness argument. The unit of scaling is a stateless replica, and all
//! replicas coordinate through the shared Postgres instance.

pub mod connection;
pub mod locked_transaction;
pub mod migrations;
pub mod sql_functions;
pub mod upsert;

pub use connection::DatabaseConnection;
pub use locked_transaction::{with_locked_transaction, LockedTransaction};
pub use migrations::DatabaseMigrations;
pub use sql_functions::{SqlFunctionExecutor, UpsertRow};
pub use upsert::{ConflictTarget, UpsertOutcome};
