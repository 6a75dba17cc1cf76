//! Commitments: what a locked balance is supposed to be backing.
//!
//! Open orders and withdrawal requests live in other subsystems and are
//! only observed here (for reconciliation). A [`CommitmentRef`] is the
//! ledger-side handle a lock is taken under; the lock manager keeps one
//! [`LockRecord`] per reference inside the owning balance row.
//!
//! ```text
//!   lock ──▶ OPEN ──release/settle (partial)──▶ OPEN
//!             │
//!             └──release/settle (remaining = 0)──▶ CLOSED
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Asset, BalanceRow, MarketPair, OrderId, SettlementRequestId, TxSubtype, WithdrawalId};

// ---------------------------------------------------------------------------
// CommitmentRef
// ---------------------------------------------------------------------------

/// The commitment a lock backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CommitmentRef {
    Order(OrderId),
    Withdrawal(WithdrawalId),
    Settlement(SettlementRequestId),
}

impl CommitmentRef {
    /// Log subtype used when taking a lock for this commitment.
    #[must_use]
    pub fn lock_subtype(&self) -> TxSubtype {
        match self {
            Self::Order(_) => TxSubtype::OrderLock,
            Self::Withdrawal(_) => TxSubtype::WithdrawalLock,
            Self::Settlement(_) => TxSubtype::SettlementLock,
        }
    }
}

impl fmt::Display for CommitmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order(id) => write!(f, "order:{id}"),
            Self::Withdrawal(id) => write!(f, "withdrawal:{id}"),
            Self::Settlement(id) => write!(f, "settlement:{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock records
// ---------------------------------------------------------------------------

/// Ledger-side bookkeeping for one commitment's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub commitment: CommitmentRef,
    /// Total ever locked under this commitment.
    pub locked: Decimal,
    /// Total returned to the free bucket.
    pub released: Decimal,
    /// Total finalized into a debit.
    pub settled: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockRecord {
    #[must_use]
    pub fn new(commitment: CommitmentRef, amount: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            commitment,
            locked: amount,
            released: Decimal::ZERO,
            settled: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount still held for this commitment.
    #[must_use]
    pub fn outstanding(&self) -> Decimal {
        self.locked - self.released - self.settled
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.outstanding() > Decimal::ZERO
    }
}

/// Outcome of `lock` / `release` / `settle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    pub commitment: CommitmentRef,
    /// `false` when the call was a replay of an earlier identical call.
    pub applied: bool,
    /// Row state right after the operation was (originally) applied.
    pub balance: BalanceRow,
}

// ---------------------------------------------------------------------------
// External commitments (observed, not owned)
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// An open order as reported by the order subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub symbol: MarketPair,
    pub side: OrderSide,
    pub price: Decimal,
    /// Unfilled base quantity.
    pub remaining_amount: Decimal,
}

impl OpenOrder {
    /// Asset this order keeps locked: quote for buys, base for sells.
    #[must_use]
    pub fn locked_asset(&self) -> &str {
        match self.side {
            OrderSide::Buy => &self.symbol.quote,
            OrderSide::Sell => &self.symbol.base,
        }
    }

    /// Amount of `asset` this order should be holding, zero if it holds a
    /// different asset.
    #[must_use]
    pub fn holding_of(&self, asset: &str) -> Decimal {
        if self.locked_asset() != asset {
            return Decimal::ZERO;
        }
        match self.side {
            OrderSide::Buy => self.remaining_amount * self.price,
            OrderSide::Sell => self.remaining_amount,
        }
    }
}

/// Withdrawal request lifecycle as seen by the withdrawal subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Submitted,
    Completed,
    Cancelled,
    Failed,
}

impl WithdrawalStatus {
    /// Pending and submitted requests still hold funds.
    #[must_use]
    pub fn holds_funds(self) -> bool {
        matches!(self, Self::Pending | Self::Submitted)
    }
}

/// A withdrawal request as reported by the withdrawal subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub withdrawal_id: WithdrawalId,
    pub asset: Asset,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: OrderSide, price: i64, remaining: i64) -> OpenOrder {
        OpenOrder {
            order_id: OrderId::new(),
            symbol: MarketPair::new("BTC", "USDT"),
            side,
            price: Decimal::new(price, 0),
            remaining_amount: Decimal::new(remaining, 0),
        }
    }

    #[test]
    fn buy_order_holds_quote() {
        let o = order(OrderSide::Buy, 100, 3);
        assert_eq!(o.locked_asset(), "USDT");
        assert_eq!(o.holding_of("USDT"), Decimal::new(300, 0));
        assert_eq!(o.holding_of("BTC"), Decimal::ZERO);
    }

    #[test]
    fn sell_order_holds_base() {
        let o = order(OrderSide::Sell, 100, 3);
        assert_eq!(o.locked_asset(), "BTC");
        assert_eq!(o.holding_of("BTC"), Decimal::new(3, 0));
        assert_eq!(o.holding_of("USDT"), Decimal::ZERO);
    }

    #[test]
    fn lock_record_outstanding() {
        let mut rec = LockRecord::new(
            CommitmentRef::Order(OrderId::new()),
            Decimal::new(50, 0),
            Utc::now(),
        );
        assert!(rec.is_open());
        rec.released = Decimal::new(20, 0);
        rec.settled = Decimal::new(30, 0);
        assert_eq!(rec.outstanding(), Decimal::ZERO);
        assert!(!rec.is_open());
    }

    #[test]
    fn withdrawal_status_holds_funds() {
        assert!(WithdrawalStatus::Pending.holds_funds());
        assert!(WithdrawalStatus::Submitted.holds_funds());
        assert!(!WithdrawalStatus::Completed.holds_funds());
        assert!(!WithdrawalStatus::Cancelled.holds_funds());
    }

    #[test]
    fn commitment_display_and_subtype() {
        let id = WithdrawalId::new();
        let c = CommitmentRef::Withdrawal(id);
        assert_eq!(c.to_string(), format!("withdrawal:{id}"));
        assert_eq!(c.lock_subtype(), TxSubtype::WithdrawalLock);
    }
}
