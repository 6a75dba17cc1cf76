//! Commission cascade.
//!
//! A qualifying action by a referee pays a share of its amount to each
//! ancestor in the sponsor chain, one configured rate per level:
//! 1. Resolve the next sponsor; a missing sponsor ends the walk
//! 2. Check the level's badge rule against that sponsor
//! 3. Eligible: credit the reward token (idempotent per referee, action
//!    and level) and record a `credited` event
//! 4. Ineligible: stop, forfeit and move on, or roll the level up to the
//!    next ancestor, depending on [`IneligiblePolicy`]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tally_ledger::LedgerStore;
use tally_types::{
    Badge, CommissionConfig, CommissionEvent, CommissionStatus, IdempotencyKey, IneligiblePolicy,
    Result, SourceAction, TallyError, TxSubtype, UserId,
};
use tracing::{debug, info, warn};

use crate::registry::SponsorDirectory;

/// Decides whether a sponsor qualifies for a level.
pub trait BadgePolicy: Send + Sync {
    fn meets_minimum_badge(&self, user_id: UserId, required: &Badge) -> bool;
}

/// Every sponsor qualifies regardless of badge.
pub struct OpenEligibility;

impl BadgePolicy for OpenEligibility {
    fn meets_minimum_badge(&self, _: UserId, _: &Badge) -> bool {
        true
    }
}

/// One level of a planned cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedCommission {
    pub level: u8,
    pub sponsor_id: UserId,
    pub amount: Decimal,
    pub status: CommissionStatus,
}

/// Result of one `apply_commission` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeOutcome {
    /// Events written by this call.
    pub events: Vec<CommissionEvent>,
    /// Levels that already had an event (retried action).
    pub replayed: usize,
    /// Sum of the credited events written by this call.
    pub total_credited: Decimal,
}

pub struct CommissionCascade {
    store: Arc<LedgerStore>,
    directory: Arc<dyn SponsorDirectory>,
    badges: Arc<dyn BadgePolicy>,
    reward_asset: String,
    config: CommissionConfig,
    events: Mutex<BTreeMap<String, CommissionEvent>>,
}

impl CommissionCascade {
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        directory: Arc<dyn SponsorDirectory>,
        badges: Arc<dyn BadgePolicy>,
        reward_asset: impl Into<String>,
        config: CommissionConfig,
    ) -> Self {
        Self {
            store,
            directory,
            badges,
            reward_asset: reward_asset.into(),
            config,
            events: Mutex::new(BTreeMap::new()),
        }
    }

    /// Walk the referee's sponsor chain and pay every level it reaches.
    ///
    /// Retrying the same `(referee, source_action)` pays nothing twice.
    ///
    /// # Errors
    /// `InvalidAmount` for a non-positive amount; ledger errors otherwise.
    pub fn apply_commission(
        &self,
        referee_id: UserId,
        source_action: &SourceAction,
        amount: Decimal,
    ) -> Result<CascadeOutcome> {
        if amount <= Decimal::ZERO {
            return Err(TallyError::InvalidAmount {
                reason: format!("commission base must be positive, got {amount}"),
            });
        }
        let plan = self.plan(referee_id, source_action, amount);
        self.commit(referee_id, source_action, &plan)
    }

    /// The levels a cascade would pay right now, without writing anything.
    #[must_use]
    pub fn plan(
        &self,
        referee_id: UserId,
        source_action: &SourceAction,
        amount: Decimal,
    ) -> Vec<PlannedCommission> {
        let rules = self.config.levels(source_action.kind);
        let max_hops = match self.config.ineligible_policy {
            IneligiblePolicy::RollUp => rules.len() + self.config.roll_up_extra_hops,
            _ => rules.len(),
        };

        let mut planned = Vec::new();
        let mut visited = HashSet::from([referee_id]);
        let mut current = referee_id;
        let mut level_idx = 0usize;
        let mut hops = 0usize;

        while level_idx < rules.len() && hops < max_hops {
            let level = u8::try_from(level_idx + 1).unwrap_or(u8::MAX);
            let Some(sponsor) = self.directory.sponsor_of(current) else {
                let broken = TallyError::SponsorChainBroken {
                    user: current,
                    level,
                };
                debug!(referee = %referee_id, action = %source_action, %broken, "Cascade ended");
                break;
            };
            if !visited.insert(sponsor) {
                warn!(referee = %referee_id, sponsor = %sponsor, "Sponsor chain loops; cascade stopped");
                break;
            }
            hops += 1;
            current = sponsor;

            let rule = &rules[level_idx];
            let share = (amount * rule.rate).round_dp(8);
            let eligible = rule
                .required_badge
                .as_ref()
                .is_none_or(|badge| self.badges.meets_minimum_badge(sponsor, badge));

            if eligible {
                if !share.is_zero() {
                    planned.push(PlannedCommission {
                        level,
                        sponsor_id: sponsor,
                        amount: share,
                        status: CommissionStatus::Credited,
                    });
                }
                level_idx += 1;
                continue;
            }

            debug!(
                referee = %referee_id,
                sponsor = %sponsor,
                level,
                policy = ?self.config.ineligible_policy,
                "Sponsor ineligible for level"
            );
            match self.config.ineligible_policy {
                IneligiblePolicy::Stop => break,
                IneligiblePolicy::SkipAndContinue => {
                    planned.push(PlannedCommission {
                        level,
                        sponsor_id: sponsor,
                        amount: share,
                        status: CommissionStatus::Forfeited,
                    });
                    level_idx += 1;
                }
                IneligiblePolicy::RollUp => {}
            }
        }

        planned
    }

    /// Write the ledger credit and the event row for every planned level
    /// that has no event yet.
    pub(crate) fn commit(
        &self,
        referee_id: UserId,
        source_action: &SourceAction,
        plan: &[PlannedCommission],
    ) -> Result<CascadeOutcome> {
        let mut outcome = CascadeOutcome::default();

        for line in plan {
            let key = CommissionEvent::key_for(referee_id, source_action, line.level);
            if self.events.lock().contains_key(&key) {
                outcome.replayed += 1;
                continue;
            }

            // Whoever inserts the event owns the level, even if another
            // caller's credit landed first.
            if line.status == CommissionStatus::Credited {
                self.store.record_transaction(
                    line.sponsor_id,
                    &self.reward_asset,
                    self.config.credit_bucket,
                    line.amount,
                    TxSubtype::CommissionCredit,
                    &IdempotencyKey::new(key.clone()),
                    json!({
                        "referee": referee_id,
                        "source_action": source_action,
                        "level": line.level,
                    }),
                )?;
            }

            let event = CommissionEvent {
                referee_id,
                sponsor_id: line.sponsor_id,
                level: line.level,
                source_action: source_action.clone(),
                amount: line.amount,
                status: line.status,
                created_at: Utc::now(),
            };
            let inserted = {
                let mut events = self.events.lock();
                if events.contains_key(&key) {
                    false
                } else {
                    events.insert(key, event.clone());
                    true
                }
            };
            if !inserted {
                outcome.replayed += 1;
                continue;
            }

            if line.status == CommissionStatus::Credited {
                outcome.total_credited += line.amount;
            }
            info!(
                referee = %referee_id,
                sponsor = %line.sponsor_id,
                action = %source_action,
                level = line.level,
                amount = %line.amount,
                status = ?line.status,
                "Commission recorded"
            );
            outcome.events.push(event);
        }

        Ok(outcome)
    }

    #[must_use]
    pub fn has_event(&self, key: &str) -> bool {
        self.events.lock().contains_key(key)
    }

    #[must_use]
    pub fn events_for_referee(&self, referee_id: UserId) -> Vec<CommissionEvent> {
        self.events
            .lock()
            .values()
            .filter(|e| e.referee_id == referee_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn events_for_sponsor(&self, sponsor_id: UserId) -> Vec<CommissionEvent> {
        self.events
            .lock()
            .values()
            .filter(|e| e.sponsor_id == sponsor_id)
            .cloned()
            .collect()
    }

    /// Sum of all credited commission events.
    #[must_use]
    pub fn total_credited(&self) -> Decimal {
        self.events
            .lock()
            .values()
            .filter(|e| e.status == CommissionStatus::Credited)
            .map(|e| e.amount)
            .sum()
    }

    #[must_use]
    pub fn reward_asset(&self) -> &str {
        &self.reward_asset
    }
}
