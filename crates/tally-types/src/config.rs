//! Configuration for the ledger core.
//!
//! Loaded from JSON; every section has defaults from [`crate::constants`]
//! so a partial file is enough.

use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{constants, ActionKind, Badge, BalanceBucket, Result, TallyError};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Asset code of the reward token.
    pub reward_asset: String,
    pub reconciler: ReconcilerConfig,
    pub settlement: SettlementConfig,
    pub commission: CommissionConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            reward_asset: constants::DEFAULT_REWARD_ASSET.to_string(),
            reconciler: ReconcilerConfig::default(),
            settlement: SettlementConfig::default(),
            commission: CommissionConfig::default(),
        }
    }
}

impl TallyConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| TallyError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reward_asset.trim().is_empty() {
            return Err(TallyError::Configuration("reward_asset must not be empty".into()));
        }
        self.reconciler.validate()?;
        self.settlement.validate()?;
        self.commission.validate()
    }
}

/// Reconciler ("auto-heal") settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Polling interval of the scheduled pass.
    pub interval_secs: u64,
    /// Locked balances at or below this are not inspected.
    pub epsilon: Decimal,
    /// Optimistic-recheck retries per row before giving up for this pass.
    pub max_conflict_retries: u32,
    /// Also lock funds when a row holds less than its commitments need.
    /// Off by default: a commitment may be recorded before its lock lands.
    pub correct_under_locked: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: constants::DEFAULT_RECONCILE_INTERVAL_SECS,
            epsilon: constants::default_reconcile_epsilon(),
            max_conflict_retries: constants::DEFAULT_RECONCILE_CONFLICT_RETRIES,
            correct_under_locked: false,
        }
    }
}

impl ReconcilerConfig {
    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(TallyError::Configuration(
                "reconciler.interval_secs must be positive".into(),
            ));
        }
        if self.epsilon.is_sign_negative() {
            return Err(TallyError::Configuration(
                "reconciler.epsilon must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Settlement coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Lifetime of a pending leg before it can be expired.
    pub ttl_secs: i64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            ttl_secs: constants::DEFAULT_SETTLEMENT_TTL_SECS,
        }
    }
}

impl SettlementConfig {
    fn validate(&self) -> Result<()> {
        if self.ttl_secs <= 0 || self.ttl_secs > constants::MAX_SETTLEMENT_TTL_SECS {
            return Err(TallyError::Configuration(format!(
                "settlement.ttl_secs must be in 1..={}, got {}",
                constants::MAX_SETTLEMENT_TTL_SECS,
                self.ttl_secs
            )));
        }
        Ok(())
    }
}

/// What to do when an ancestor fails the badge rule of its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligiblePolicy {
    /// End the cascade at the first ineligible ancestor.
    Stop,
    /// Forfeit that level and continue with the next ancestor at the next
    /// level.
    SkipAndContinue,
    /// Keep the level open and offer it to the next ancestor up the chain.
    RollUp,
}

/// Rate and eligibility rule for one level of the cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRule {
    /// Fraction of the base amount, e.g. `0.10`.
    pub rate: Decimal,
    /// Badge the ancestor must hold; `None` means everyone qualifies.
    #[serde(default)]
    pub required_badge: Option<Badge>,
}

impl LevelRule {
    #[must_use]
    pub fn new(rate: Decimal) -> Self {
        Self {
            rate,
            required_badge: None,
        }
    }

    #[must_use]
    pub fn with_badge(mut self, badge: Badge) -> Self {
        self.required_badge = Some(badge);
        self
    }
}

/// Commission cascade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionConfig {
    /// Level rules per qualifying action; level 1 first. Actions without a
    /// schedule pay nothing.
    pub schedules: BTreeMap<ActionKind, Vec<LevelRule>>,
    pub ineligible_policy: IneligiblePolicy,
    /// Reward-token bucket the credit lands in.
    pub credit_bucket: BalanceBucket,
    /// Additional ancestors a roll-up walk may inspect.
    pub roll_up_extra_hops: usize,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            schedules: BTreeMap::new(),
            ineligible_policy: IneligiblePolicy::Stop,
            credit_bucket: BalanceBucket::Available,
            roll_up_extra_hops: constants::DEFAULT_ROLL_UP_EXTRA_HOPS,
        }
    }
}

impl CommissionConfig {
    /// Level rules for `kind`, empty if the action pays nothing.
    #[must_use]
    pub fn levels(&self, kind: ActionKind) -> &[LevelRule] {
        self.schedules.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn validate(&self) -> Result<()> {
        for (kind, levels) in &self.schedules {
            if levels.len() > constants::MAX_COMMISSION_DEPTH {
                return Err(TallyError::Configuration(format!(
                    "commission.schedules.{kind}: {} levels exceeds max depth {}",
                    levels.len(),
                    constants::MAX_COMMISSION_DEPTH
                )));
            }
            for (idx, rule) in levels.iter().enumerate() {
                if rule.rate.is_sign_negative() || rule.rate > Decimal::ONE {
                    return Err(TallyError::Configuration(format!(
                        "commission.schedules.{kind}[{idx}]: rate {} outside [0, 1]",
                        rule.rate
                    )));
                }
            }
        }
        Ok(())
    }
}
