//! Commission backfill.
//!
//! Replays every historical qualifying action through the cascade and
//! writes only the levels that have no event yet. Running it twice pays
//! nothing the second time; a dry run reports what would be written.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tally_types::{ActionKind, CommissionEvent, CommissionStatus, QualifyingAction, Result};
use tracing::{info, warn};

use crate::cascade::CommissionCascade;

/// Source of historical qualifying actions (purchases, KYC approvals, ...).
pub trait ActionHistory: Send + Sync {
    fn qualifying_actions(&self) -> Result<Vec<QualifyingAction>>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub dry_run: bool,
    pub actions_scanned: usize,
    /// Levels that were missing and got (or would get) an event.
    pub missing_levels: usize,
    /// Levels that already had an event.
    pub already_present: usize,
    pub total_credited: Decimal,
    pub per_kind: BTreeMap<ActionKind, Decimal>,
    /// Actions whose cascade failed; the rest of the run continues.
    pub failed: usize,
}

impl CommissionCascade {
    /// Fill in missing commission events for every historical action.
    ///
    /// # Errors
    /// Only if the history itself cannot be read. Per-action failures are
    /// counted in the report.
    pub fn backfill_commissions(
        &self,
        history: &dyn ActionHistory,
        dry_run: bool,
    ) -> Result<BackfillReport> {
        let mut actions = history.qualifying_actions()?;
        actions.sort_by_key(|a| a.occurred_at);

        let mut report = BackfillReport {
            dry_run,
            ..BackfillReport::default()
        };

        for action in &actions {
            report.actions_scanned += 1;
            if action.amount <= Decimal::ZERO {
                continue;
            }
            let plan = self.plan(action.referee_id, &action.action, action.amount);
            let (present, missing): (Vec<_>, Vec<_>) = plan.into_iter().partition(|line| {
                self.has_event(&CommissionEvent::key_for(
                    action.referee_id,
                    &action.action,
                    line.level,
                ))
            });
            report.already_present += present.len();

            if dry_run {
                report.missing_levels += missing.len();
                let owed: Decimal = missing
                    .iter()
                    .filter(|l| l.status == CommissionStatus::Credited)
                    .map(|l| l.amount)
                    .sum();
                report.total_credited += owed;
                *report.per_kind.entry(action.action.kind).or_default() += owed;
                continue;
            }

            match self.commit(action.referee_id, &action.action, &missing) {
                Ok(outcome) => {
                    report.missing_levels += outcome.events.len();
                    report.already_present += outcome.replayed;
                    report.total_credited += outcome.total_credited;
                    *report.per_kind.entry(action.action.kind).or_default() +=
                        outcome.total_credited;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        referee = %action.referee_id,
                        action = %action.action,
                        error = %e,
                        "Backfill of action failed"
                    );
                }
            }
        }

        info!(
            dry_run,
            scanned = report.actions_scanned,
            missing = report.missing_levels,
            present = report.already_present,
            credited = %report.total_credited,
            failed = report.failed,
            "Commission backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::OpenEligibility;
    use crate::ReferralRegistry;
    use chrono::Utc;
    use std::sync::Arc;
    use tally_ledger::LedgerStore;
    use tally_types::{CommissionConfig, LevelRule, SourceAction, TallyError, UserId};

    struct Broken;

    impl ActionHistory for Broken {
        fn qualifying_actions(&self) -> Result<Vec<QualifyingAction>> {
            Err(TallyError::Internal("history offline".into()))
        }
    }

    struct Fixed(Vec<QualifyingAction>);

    impl ActionHistory for Fixed {
        fn qualifying_actions(&self) -> Result<Vec<QualifyingAction>> {
            Ok(self.0.clone())
        }
    }

    fn cascade(registry: Arc<ReferralRegistry>) -> CommissionCascade {
        let config = CommissionConfig {
            schedules: BTreeMap::from([(
                ActionKind::KycApproval,
                vec![LevelRule::new(Decimal::new(10, 2))],
            )]),
            ..CommissionConfig::default()
        };
        CommissionCascade::new(
            Arc::new(LedgerStore::new()),
            registry,
            Arc::new(OpenEligibility),
            "RWD",
            config,
        )
    }

    #[test]
    fn unreadable_history_is_an_error() {
        let c = cascade(Arc::new(ReferralRegistry::new()));
        assert!(c.backfill_commissions(&Broken, false).is_err());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let registry = Arc::new(ReferralRegistry::new());
        let (user, sponsor) = (UserId::new(), UserId::new());
        registry.assign_sponsor(user, sponsor).unwrap();
        let c = cascade(registry);
        let history = Fixed(vec![QualifyingAction {
            referee_id: user,
            action: SourceAction::new(ActionKind::KycApproval, "kyc-1"),
            amount: Decimal::new(50, 0),
            occurred_at: Utc::now(),
        }]);

        let report = c.backfill_commissions(&history, true).unwrap();
        assert_eq!(report.missing_levels, 1);
        assert_eq!(report.total_credited, Decimal::new(5, 0));
        assert!(c.events_for_referee(user).is_empty());
        assert_eq!(c.total_credited(), Decimal::ZERO);
    }

    #[test]
    fn zero_amount_actions_are_skipped() {
        let registry = Arc::new(ReferralRegistry::new());
        let (user, sponsor) = (UserId::new(), UserId::new());
        registry.assign_sponsor(user, sponsor).unwrap();
        let c = cascade(registry);
        let history = Fixed(vec![QualifyingAction {
            referee_id: user,
            action: SourceAction::new(ActionKind::KycApproval, "kyc-1"),
            amount: Decimal::ZERO,
            occurred_at: Utc::now(),
        }]);

        let report = c.backfill_commissions(&history, false).unwrap();
        assert_eq!(report.actions_scanned, 1);
        assert_eq!(report.missing_levels, 0);
    }
}
