//! # tally-ledger
//!
//! **Ledger plane**: the balance store, its idempotent transaction log,
//! the lock manager and the reconciler.
//!
//! ## Architecture
//!
//! 1. **LedgerStore**: per-(user, asset) balance rows and their append-only
//!    log; every mutation runs under the row's exclusive lock
//! 2. **LockManager**: lock / release / settle funds under a commitment
//! 3. **Reconciler**: finds locked funds no open commitment accounts for
//!    and returns them to `available`
//! 4. **ReconcileScheduler**: runs the reconciler on an interval
//! 5. **audit**: proves every row equals the fold of its log
//!
//! ## Write Path
//!
//! ```text
//! caller → LockManager / record_transaction → LedgerStore.transact()
//!        → [row lock] replay check → validate → append entries → commit
//! ```

pub mod audit;
pub mod lock_manager;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use audit::{AuditReport, audit};
pub use lock_manager::LockManager;
pub use reconciler::{CommitmentSource, Correction, ReconcileOutcome, ReconcileSummary, Reconciler};
pub use scheduler::{ReconcileScheduler, SchedulerHandle};
pub use store::{LedgerStore, RowSnapshot, RowView, RowWrite};
pub use telemetry::{LogFormat, init_tracing};
