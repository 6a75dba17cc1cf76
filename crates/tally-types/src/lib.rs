//! # tally-types
//!
//! Shared types, errors, and configuration for the **Tally** ledger core.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`UserId`], [`OrderId`], [`WithdrawalId`], [`TradeId`], [`SettlementRequestId`], [`EntryId`], [`MarketPair`]
//! - **Balance model**: [`BalanceRow`], [`BalanceBucket`], [`Asset`]
//! - **Transaction log**: [`LogEntry`], [`IdempotencyKey`], [`TxSubtype`], [`Posting`], [`TransactionReceipt`]
//! - **Commitments**: [`CommitmentRef`], [`LockRecord`], [`OpenOrder`], [`PendingWithdrawal`]
//! - **Settlement**: [`SettlementRequest`], [`SettlementStatus`], [`SettlementLeg`]
//! - **Referral**: [`ReferralLink`], [`CommissionEvent`], [`SourceAction`], [`Badge`]
//! - **Configuration**: [`TallyConfig`] and its sections
//! - **Errors**: [`TallyError`] with `TL_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod balance;
pub mod commitment;
pub mod config;
pub mod constants;
pub mod error;
#[cfg(any(test, feature = "test-helpers"))]
pub mod fixtures;
pub mod ids;
pub mod referral;
pub mod settlement;
pub mod transaction;

// Re-export all primary types at crate root for ergonomic imports:
//   use tally_types::{BalanceRow, CommitmentRef, SettlementRequest, ...};

pub use balance::*;
pub use commitment::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use referral::*;
pub use settlement::*;
pub use transaction::*;

// Constants are accessed via `tally_types::constants::FOO`
// (not re-exported to avoid name collisions).
