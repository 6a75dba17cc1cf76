//! Transaction-log types.
//!
//! The log is append-only. A logical operation carries one caller-chosen
//! [`IdempotencyKey`] and writes one [`LogEntry`] per bucket it touches;
//! all entries of an operation share that key. A balance row is the fold
//! of its entries.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Asset, BalanceBucket, BalanceRow, EntryId, UserId};

/// Caller-supplied key guaranteeing an operation applies at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What kind of mutation produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxSubtype {
    /// External credit (deposit crediting subsystem).
    Deposit,
    /// External debit straight from the free bucket.
    Withdrawal,
    /// available → locked for an order.
    OrderLock,
    /// available → locked for a withdrawal request.
    WithdrawalLock,
    /// available → locked as settlement-leg collateral.
    SettlementLock,
    /// locked → available, commitment cancelled or expired.
    LockRelease,
    /// locked → gone, commitment fulfilled.
    LockSettle,
    /// Referral reward credit.
    CommissionCredit,
    /// Corrective entry written by the reconciler.
    ReconciliationFix,
    /// Manual operator adjustment.
    Adjustment,
}

impl TxSubtype {
    /// Whether entries of this subtype move value across the platform
    /// boundary (as opposed to shuffling it between buckets).
    #[must_use]
    pub fn is_external_flow(self) -> bool {
        matches!(
            self,
            Self::Deposit
                | Self::Withdrawal
                | Self::LockSettle
                | Self::CommissionCredit
                | Self::Adjustment
        )
    }
}

impl fmt::Display for TxSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::OrderLock => "order-lock",
            Self::WithdrawalLock => "withdrawal-lock",
            Self::SettlementLock => "settlement-lock",
            Self::LockRelease => "lock-release",
            Self::LockSettle => "lock-settle",
            Self::CommissionCredit => "commission-credit",
            Self::ReconciliationFix => "reconciliation-fix",
            Self::Adjustment => "adjustment",
        };
        f.write_str(s)
    }
}

/// One signed change to one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub bucket: BalanceBucket,
    pub delta: Decimal,
}

impl Posting {
    #[must_use]
    pub fn new(bucket: BalanceBucket, delta: Decimal) -> Self {
        Self { bucket, delta }
    }

    /// Postings for moving `amount` from one bucket to the other.
    #[must_use]
    pub fn transfer(from: BalanceBucket, to: BalanceBucket, amount: Decimal) -> [Self; 2] {
        [Self::new(from, -amount), Self::new(to, amount)]
    }
}

/// An immutable transaction-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub idempotency_key: IdempotencyKey,
    pub user_id: UserId,
    pub asset: Asset,
    pub bucket: BalanceBucket,
    pub delta: Decimal,
    pub subtype: TxSubtype,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Result of recording an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    /// `false` when the key had already been applied and this call was a
    /// replay.
    pub applied: bool,
    /// Row state right after the original application of the key.
    pub balance: BalanceRow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_postings_net_to_zero() {
        let [a, b] = Posting::transfer(
            BalanceBucket::Available,
            BalanceBucket::Locked,
            Decimal::new(30, 0),
        );
        assert_eq!(a.delta + b.delta, Decimal::ZERO);
        assert_eq!(a.bucket, BalanceBucket::Available);
        assert_eq!(b.bucket, BalanceBucket::Locked);
    }

    #[test]
    fn subtype_display_matches_serde() {
        let json = serde_json::to_string(&TxSubtype::ReconciliationFix).unwrap();
        assert_eq!(json, "\"reconciliation-fix\"");
        assert_eq!(TxSubtype::ReconciliationFix.to_string(), "reconciliation-fix");
    }

    #[test]
    fn bucket_moves_are_not_external() {
        assert!(!TxSubtype::OrderLock.is_external_flow());
        assert!(!TxSubtype::LockRelease.is_external_flow());
        assert!(!TxSubtype::ReconciliationFix.is_external_flow());
        assert!(TxSubtype::LockSettle.is_external_flow());
        assert!(TxSubtype::CommissionCredit.is_external_flow());
    }
}
