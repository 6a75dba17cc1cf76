//! # Settlement requests: one row per on-chain leg of a matched trade
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐ tx hash  ┌───────────┐ verified  ┌───────────┐
//!   │ PENDING ├─────────▶│ SUBMITTED ├──────────▶│ CONFIRMED │
//!   └──┬───┬──┘          └─────┬─────┘           └───────────┘
//!      │   │ deadline          │ rejected / verification failed
//!      │   ▼                   ▼
//!      │ ┌─────────┐      ┌────────┐
//!      │ │ EXPIRED │      │ FAILED │
//!      │ └─────────┘      └────────┘
//!      └──────── rejected ────▲
//! ```
//!
//! Confirmed, failed and expired are terminal. A trade is settled only
//! once every one of its legs is confirmed.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Asset, SettlementRequestId, TallyError, TradeId, UserId};

/// Lifecycle state of a settlement leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Expired,
}

impl SettlementStatus {
    /// Can a leg move from `self` to `target`?
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Submitted | Self::Failed | Self::Expired)
                | (Self::Submitted, Self::Confirmed | Self::Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Expired)
    }

    /// Failed and expired legs are treated identically for balances.
    #[must_use]
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::Expired)
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Which way value moves for the obligor of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementDirection {
    /// Obligor pays out; collateral is locked until the leg resolves.
    Send,
    /// Obligor receives; nothing is locked on their side.
    Receive,
}

/// Input describing one leg of a trade to settle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLeg {
    pub user_id: UserId,
    pub counterparty_id: UserId,
    pub direction: SettlementDirection,
    pub asset: Asset,
    pub amount: Decimal,
    /// Address the on-chain transfer must pay to.
    pub destination_address: String,
}

/// Persisted settlement leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub id: SettlementRequestId,
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub counterparty_id: UserId,
    pub direction: SettlementDirection,
    pub asset: Asset,
    pub amount: Decimal,
    pub destination_address: String,
    pub status: SettlementStatus,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRequest {
    /// Build a fresh pending row for `leg`.
    #[must_use]
    pub fn pending(
        trade_id: TradeId,
        leg_index: u32,
        leg: SettlementLeg,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SettlementRequestId::for_leg(trade_id, leg_index),
            trade_id,
            user_id: leg.user_id,
            counterparty_id: leg.counterparty_id,
            direction: leg.direction,
            asset: leg.asset,
            amount: leg.amount,
            destination_address: leg.destination_address,
            status: SettlementStatus::Pending,
            tx_hash: None,
            failure_reason: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether collateral was locked for this leg.
    #[must_use]
    pub fn holds_collateral(&self) -> bool {
        self.direction == SettlementDirection::Send
    }

    /// Still pending after its deadline.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == SettlementStatus::Pending && now > self.expires_at
    }

    /// Move to `target`, or fail with `InvalidTransition`.
    pub fn transition(&mut self, target: SettlementStatus, now: DateTime<Utc>) -> crate::Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(TallyError::InvalidTransition {
                request: self.id,
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }
}

/// Aggregate state of a trade derived from its legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSettlementState {
    /// At least one leg is still pending or submitted.
    InProgress,
    /// Every leg confirmed; collateral finalized.
    Settled,
    /// A leg failed or expired; collateral released.
    Failed,
}

impl fmt::Display for TradeSettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request() -> SettlementRequest {
        let now = Utc::now();
        SettlementRequest::pending(
            TradeId::new(),
            0,
            SettlementLeg {
                user_id: UserId::new(),
                counterparty_id: UserId::new(),
                direction: SettlementDirection::Send,
                asset: "BTC".into(),
                amount: Decimal::ONE,
                destination_address: "bc1qcounterparty".into(),
            },
            now + chrono::Duration::minutes(30),
            now,
        )
    }

    #[test]
    fn valid_transitions() {
        use SettlementStatus::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Expired));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Submitted.can_transition_to(Failed));
    }

    #[test]
    fn invalid_transitions() {
        use SettlementStatus::*;
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Submitted.can_transition_to(Expired));
        assert!(!Submitted.can_transition_to(Pending));
        for terminal in [Confirmed, Failed, Expired] {
            for target in [Pending, Submitted, Confirmed, Failed, Expired] {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn transition_rejects_with_invalid_transition() {
        let mut req = make_request();
        let err = req
            .transition(SettlementStatus::Confirmed, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            TallyError::InvalidTransition {
                from: SettlementStatus::Pending,
                to: SettlementStatus::Confirmed,
                ..
            }
        ));
        assert_eq!(req.status, SettlementStatus::Pending);
    }

    #[test]
    fn overdue_only_when_pending() {
        let mut req = make_request();
        let later = req.expires_at + chrono::Duration::seconds(1);
        assert!(req.is_overdue(later));
        assert!(!req.is_overdue(req.created_at));
        req.transition(SettlementStatus::Submitted, later).unwrap();
        assert!(!req.is_overdue(later));
    }

    #[test]
    fn leg_id_is_deterministic() {
        let req = make_request();
        assert_eq!(req.id, SettlementRequestId::for_leg(req.trade_id, 0));
        assert!(req.holds_collateral());
    }
}
