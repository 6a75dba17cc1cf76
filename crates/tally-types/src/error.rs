//! Error types for the Tally ledger.
//!
//! All errors use the `TL_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Balance / transaction-log errors
//! - 2xx: Lock manager errors
//! - 3xx: Reconciliation errors
//! - 4xx: Settlement errors
//! - 5xx: Referral / commission errors
//! - 6xx: Audit errors
//! - 9xx: General / internal errors
//!
//! `DuplicateOperation`, `ReconciliationConflict` and `SponsorChainBroken`
//! are resolved inside the core and never reach callers of the public
//! operations; they exist so internal layers can signal them.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{Asset, BalanceBucket, CommitmentRef, SettlementRequestId, SettlementStatus, TradeId, UserId};

/// Central error enum for all Tally operations.
#[derive(Debug, Error)]
pub enum TallyError {
    // =================================================================
    // Balance / Log Errors (1xx)
    // =================================================================
    /// A debit or lock exceeds what the bucket holds.
    #[error("TL_ERR_100: Insufficient {bucket} balance: need {needed}, have {available}")]
    InsufficientBalance {
        bucket: BalanceBucket,
        needed: Decimal,
        available: Decimal,
    },

    /// The idempotency key was already applied.
    #[error("TL_ERR_101: Duplicate operation: {key}")]
    DuplicateOperation { key: String },

    /// Amount is zero, negative where a positive value is required, or
    /// otherwise unusable.
    #[error("TL_ERR_102: Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    // =================================================================
    // Lock Errors (2xx)
    // =================================================================
    /// release/settle referenced a commitment with no lock on this row.
    #[error("TL_ERR_200: Commitment not found: {commitment} ({user}/{asset})")]
    CommitmentNotFound {
        user: UserId,
        asset: Asset,
        commitment: CommitmentRef,
    },

    // =================================================================
    // Reconciliation Errors (3xx)
    // =================================================================
    /// The row changed between the recheck and the corrective write.
    #[error("TL_ERR_300: Reconciliation conflict on {user}/{asset}: expected version {expected}, found {found}")]
    ReconciliationConflict {
        user: UserId,
        asset: Asset,
        expected: u64,
        found: u64,
    },

    // =================================================================
    // Settlement Errors (4xx)
    // =================================================================
    /// The settlement status transition is not permitted.
    #[error("TL_ERR_400: Invalid transition for settlement {request}: {from} -> {to}")]
    InvalidTransition {
        request: SettlementRequestId,
        from: SettlementStatus,
        to: SettlementStatus,
    },

    /// No settlement leg with this ID.
    #[error("TL_ERR_401: Settlement request not found: {0}")]
    SettlementNotFound(SettlementRequestId),

    /// The trade was submitted with an unusable set of legs.
    #[error("TL_ERR_402: Invalid settlement for trade {trade}: {reason}")]
    InvalidSettlement { trade: TradeId, reason: String },

    /// The same trade ID was re-submitted with different legs.
    #[error("TL_ERR_403: Settlement for trade {0} already requested with different legs")]
    SettlementMismatch(TradeId),

    // =================================================================
    // Referral Errors (5xx)
    // =================================================================
    /// No sponsor at the required level. Ends a cascade silently.
    #[error("TL_ERR_500: Sponsor chain broken above {user} at level {level}")]
    SponsorChainBroken { user: UserId, level: u8 },

    /// The user already has a different locked sponsor.
    #[error("TL_ERR_501: Sponsor already locked for {user}: {existing}")]
    SponsorAlreadyLocked { user: UserId, existing: UserId },

    /// The link would make the sponsor chain loop (including self-referral).
    #[error("TL_ERR_502: Referral cycle: {user} cannot be sponsored by {sponsor}")]
    ReferralCycle { user: UserId, sponsor: UserId },

    // =================================================================
    // Audit Errors (6xx)
    // =================================================================
    /// A balance row no longer equals the fold of its log entries, or
    /// value was created/destroyed by a bucket move.
    #[error("TL_ERR_600: Ledger invariant violation: {reason}")]
    InvariantViolation { reason: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("TL_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("TL_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, bad values, etc.).
    #[error("TL_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("TL_ERR_903: I/O error: {0}")]
    Io(String),

    /// A collaborator (verifier, commitment source, ...) failed.
    #[error("TL_ERR_904: Collaborator unavailable: {0}")]
    Collaborator(String),
}

impl TallyError {
    /// Whether this error is meant for the caller that triggered the
    /// operation (as opposed to being resolved inside the core).
    #[must_use]
    pub fn is_caller_facing(&self) -> bool {
        !matches!(
            self,
            Self::DuplicateOperation { .. }
                | Self::ReconciliationConflict { .. }
                | Self::SponsorChainBroken { .. }
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, TallyError>;

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_display() {
        let err = TallyError::InsufficientBalance {
            bucket: BalanceBucket::Available,
            needed: Decimal::new(100, 0),
            available: Decimal::new(50, 0),
        };
        let msg = format!("{err}");
        assert!(msg.starts_with("TL_ERR_100"), "Got: {msg}");
        assert!(msg.contains("available"));
        assert!(msg.contains("100"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn invalid_transition_display() {
        let err = TallyError::InvalidTransition {
            request: SettlementRequestId::for_leg(TradeId::new(), 0),
            from: SettlementStatus::Confirmed,
            to: SettlementStatus::Failed,
        };
        let msg = format!("{err}");
        assert!(msg.contains("TL_ERR_400"));
        assert!(msg.contains("CONFIRMED"));
        assert!(msg.contains("FAILED"));
    }

    #[test]
    fn internal_errors_are_not_caller_facing() {
        assert!(!TallyError::DuplicateOperation { key: "k".into() }.is_caller_facing());
        assert!(
            !TallyError::SponsorChainBroken {
                user: UserId::new(),
                level: 2
            }
            .is_caller_facing()
        );
        assert!(
            TallyError::InsufficientBalance {
                bucket: BalanceBucket::Locked,
                needed: Decimal::ONE,
                available: Decimal::ZERO,
            }
            .is_caller_facing()
        );
    }

    #[test]
    fn all_errors_have_tl_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(TallyError::SettlementNotFound(SettlementRequestId::for_leg(
                TradeId::new(),
                1,
            ))),
            Box::new(TallyError::Internal("test".into())),
            Box::new(TallyError::Configuration("bad".into())),
            Box::new(TallyError::ReferralCycle {
                user: UserId::new(),
                sponsor: UserId::new(),
            }),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(
                msg.starts_with("TL_ERR_"),
                "Error missing TL_ERR_ prefix: {msg}"
            );
        }
    }
}
