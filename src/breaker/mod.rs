//! # DB-Backed Circuit Breakers
//!
//! Health gates for named resources, shared by every replica through one
//! Postgres row per breaker. A trip writes the gate flip and its explaining
//! incident in a single locked transaction; recovery happens lazily once the
//! trip's TTL elapses, with no background sweep.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use recovery_core::breaker::{CircuitBreakerStore, Severity};
//! use recovery_core::config::RecoveryConfig;
//! use std::time::Duration;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), recovery_core::error::RecoveryError> {
//! let store = CircuitBreakerStore::new(pool, RecoveryConfig::default());
//!
//! store.check("costsim_v2").await?;
//! match run_simulation().await {
//!     Ok(_) => store.record_success("costsim_v2").await?,
//!     Err(_) => {
//!         store.record_failure("costsim_v2", "simulation call failed").await?;
//!     }
//! }
//! # Ok(())
//! # }
//! # async fn run_simulation() -> Result<(), ()> { Ok(()) }
//! ```

pub mod incident;
pub mod notify;
pub mod state;
pub mod store;

pub use incident::{Incident, NewIncident, Severity};
pub use notify::{AlertSink, NoopAlertSink};
pub use state::CircuitBreakerState;
pub use store::CircuitBreakerStore;
