//! Balance rows for the two-bucket model.
//!
//! Every (user, asset) pair has a free bucket and a committed bucket:
//!
//! | asset kind   | free bucket    | committed bucket |
//! |--------------|----------------|------------------|
//! | trading      | `available`    | `locked`         |
//! | reward token | `withdrawable` | `holding`        |
//!
//! Rows are only ever changed by the transaction log; the `version`
//! counter increases by one for every applied operation.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which sub-balance a posting touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceBucket {
    /// Spendable funds (`withdrawable` for the reward token).
    Available,
    /// Funds backing an open commitment (`holding` for the reward token).
    Locked,
}

impl BalanceBucket {
    /// Human-facing bucket name for the given asset kind.
    #[must_use]
    pub fn label(self, reward_token: bool) -> &'static str {
        match (self, reward_token) {
            (Self::Available, false) => "available",
            (Self::Locked, false) => "locked",
            (Self::Available, true) => "withdrawable",
            (Self::Locked, true) => "holding",
        }
    }
}

impl fmt::Display for BalanceBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label(false))
    }
}

/// A single balance row for a (user, asset) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceRow {
    /// Free to spend, trade or withdraw.
    pub available: Decimal,
    /// Committed to open orders, withdrawals or settlement legs.
    pub locked: Decimal,
    /// Number of operations applied to this row.
    pub version: u64,
}

impl BalanceRow {
    /// Create a zero balance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            version: 0,
        }
    }

    /// Total balance (available + locked).
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }

    /// Whether this row holds nothing at all.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.available.is_zero() && self.locked.is_zero()
    }

    /// Current value of one bucket.
    #[must_use]
    pub fn bucket(&self, bucket: BalanceBucket) -> Decimal {
        match bucket {
            BalanceBucket::Available => self.available,
            BalanceBucket::Locked => self.locked,
        }
    }

    pub(crate) fn bucket_mut(&mut self, bucket: BalanceBucket) -> &mut Decimal {
        match bucket {
            BalanceBucket::Available => &mut self.available,
            BalanceBucket::Locked => &mut self.locked,
        }
    }

    /// Add `delta` to `bucket`. Callers validate non-negativity first.
    pub fn apply(&mut self, bucket: BalanceBucket, delta: Decimal) {
        *self.bucket_mut(bucket) += delta;
    }
}

impl Default for BalanceRow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_row_default_is_zero() {
        let row = BalanceRow::default();
        assert_eq!(row.available, Decimal::ZERO);
        assert_eq!(row.locked, Decimal::ZERO);
        assert_eq!(row.version, 0);
        assert!(row.is_zero());
    }

    #[test]
    fn apply_touches_only_target_bucket() {
        let mut row = BalanceRow::new();
        row.apply(BalanceBucket::Available, Decimal::new(100, 0));
        row.apply(BalanceBucket::Available, Decimal::new(-30, 0));
        row.apply(BalanceBucket::Locked, Decimal::new(30, 0));
        assert_eq!(row.available, Decimal::new(70, 0));
        assert_eq!(row.locked, Decimal::new(30, 0));
        assert_eq!(row.total(), Decimal::new(100, 0));
    }

    #[test]
    fn reward_token_labels() {
        assert_eq!(BalanceBucket::Available.label(true), "withdrawable");
        assert_eq!(BalanceBucket::Locked.label(true), "holding");
        assert_eq!(BalanceBucket::Locked.to_string(), "locked");
    }
}
