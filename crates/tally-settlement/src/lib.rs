//! # tally-settlement
//!
//! **Settlement plane**: drives the on-chain handoff of matched trades.
//!
//! ## Leg State Machine
//!
//! ```text
//! pending ──report_submission──► submitted ──confirm_settlement──► confirmed
//!    │                              │
//!    ├──reject / verify fails───────┴──► failed
//!    └──expire_due (deadline)──────────► expired
//! ```
//!
//! A trade settles only when every leg is confirmed. Any failed or expired
//! leg fails the trade and releases all collateral still locked for it.

pub mod coordinator;
pub mod verifier;

pub use coordinator::SettlementCoordinator;
pub use verifier::{ChainVerifier, normalize_tx_hash};
