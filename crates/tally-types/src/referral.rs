//! Referral links and commission events.
//!
//! A user's sponsor is a single immutable pointer (first writer wins).
//! Walking N levels of the sponsor chain is N sequential lookups.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::UserId;

/// `user_id → sponsor_id`, locked once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralLink {
    pub user_id: UserId,
    pub sponsor_id: UserId,
    pub linked_at: DateTime<Utc>,
}

/// Audit record of an explicit admin re-assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorOverride {
    pub user_id: UserId,
    pub previous_sponsor: Option<UserId>,
    pub new_sponsor: UserId,
    pub operator: String,
    pub reason: String,
    pub overridden_at: DateTime<Utc>,
}

/// Kind of user action that can pay referral commissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Purchase,
    KycApproval,
    Trade,
    Deposit,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Purchase => "purchase",
            Self::KycApproval => "kyc_approval",
            Self::Trade => "trade",
            Self::Deposit => "deposit",
        };
        f.write_str(s)
    }
}

/// A concrete qualifying action: its kind plus the caller's reference for
/// it (e.g. the purchase ID). Together with the referee and the level this
/// forms the commission idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SourceAction {
    pub kind: ActionKind,
    pub reference: String,
}

impl SourceAction {
    #[must_use]
    pub fn new(kind: ActionKind, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
        }
    }
}

impl fmt::Display for SourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.reference)
    }
}

/// Historical qualifying action, as reported for backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifyingAction {
    pub referee_id: UserId,
    pub action: SourceAction,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Badge tier name required for a commission level (e.g. "silver").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Badge(pub String);

impl Badge {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    /// Amount credited to the sponsor.
    Credited,
    /// Level not paid because the ancestor was ineligible.
    Forfeited,
}

/// One commission row; unique on (`referee_id`, `source_action`, `level`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub referee_id: UserId,
    pub sponsor_id: UserId,
    /// 1 = direct sponsor.
    pub level: u8,
    pub source_action: SourceAction,
    pub amount: Decimal,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
}

impl CommissionEvent {
    /// The idempotency key shared by the event row and its credit.
    #[must_use]
    pub fn key_for(referee_id: UserId, source_action: &SourceAction, level: u8) -> String {
        format!("commission:{referee_id}:{source_action}:{level}")
    }

    #[must_use]
    pub fn key(&self) -> String {
        Self::key_for(self.referee_id, &self.source_action, self.level)
    }
}
