//! # tally-referral
//!
//! **Referral plane**: sponsor links and the commission cascade.
//!
//! - [`ReferralRegistry`]: immutable `user → sponsor` links, admin override
//!   with an audit trail, cycle rejection
//! - [`CommissionCascade`]: pays each ancestor its level's share of a
//!   qualifying action into the reward-token ledger row, exactly once per
//!   `(referee, action, level)`
//! - [`ActionHistory`] + `backfill_commissions`: re-runs history and writes
//!   only missing levels
//!
//! Credits go through `LedgerStore::record_transaction` with the commission
//! event key, so a crash between the credit and the event row heals on the
//! next attempt instead of double paying.

pub mod backfill;
pub mod cascade;
pub mod registry;

pub use backfill::{ActionHistory, BackfillReport};
pub use cascade::{BadgePolicy, CascadeOutcome, CommissionCascade, OpenEligibility, PlannedCommission};
pub use registry::{ReferralRegistry, SponsorDirectory};
