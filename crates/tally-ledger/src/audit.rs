//! Ledger audit: fold and supply conservation checks.
//!
//! Invariants checked over the whole store:
//! ```text
//! ∀ row:   balance == fold(entries)          (per bucket)
//! ∀ row:   version == #distinct operation keys
//! ∀ op ∉ external flows: Σ delta == 0         (bucket moves create nothing)
//! ∀ asset: Σ(available + locked) == inflows − outflows
//! ```
//!
//! Any failure means a mutation bypassed the log.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::Serialize;
use tally_types::{Asset, BalanceBucket, IdempotencyKey, Result, TallyError};
use tracing::{error, info};

use crate::store::{LedgerStore, RowHistory};

/// External inflows and outflows of one asset against what the rows hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssetSupply {
    pub inflows: Decimal,
    pub outflows: Decimal,
    /// Σ(available + locked) over all rows.
    pub held: Decimal,
}

impl AssetSupply {
    #[must_use]
    pub fn expected(&self) -> Decimal {
        self.inflows - self.outflows
    }

    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.held == self.expected()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub rows_checked: usize,
    pub entries_checked: usize,
    pub supply: BTreeMap<Asset, AssetSupply>,
}

/// Check every row of `store`.
///
/// # Errors
/// `InvariantViolation` naming the first broken row or asset.
pub fn audit(store: &LedgerStore) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    for history in store.histories() {
        check_row(&history)?;
        report.rows_checked += 1;
        report.entries_checked += history.entries.len();

        let supply = report.supply.entry(history.asset.clone()).or_default();
        supply.held += history.balance.total();
        for entry in history.entries.iter().filter(|e| e.subtype.is_external_flow()) {
            if entry.delta > Decimal::ZERO {
                supply.inflows += entry.delta;
            } else {
                supply.outflows -= entry.delta;
            }
        }
    }

    for (asset, supply) in &report.supply {
        if !supply.is_conserved() {
            error!(
                asset = %asset,
                held = %supply.held,
                expected = %supply.expected(),
                "Supply not conserved"
            );
            return Err(TallyError::InvariantViolation {
                reason: format!(
                    "asset {asset}: held {} != inflows {} - outflows {}",
                    supply.held, supply.inflows, supply.outflows
                ),
            });
        }
    }

    info!(
        rows = report.rows_checked,
        entries = report.entries_checked,
        assets = report.supply.len(),
        "Ledger audit passed"
    );
    Ok(report)
}

fn check_row(history: &RowHistory) -> Result<()> {
    let mut available = Decimal::ZERO;
    let mut locked = Decimal::ZERO;
    let mut ops: HashMap<&IdempotencyKey, (Decimal, bool)> = HashMap::new();

    for entry in &history.entries {
        match entry.bucket {
            BalanceBucket::Available => available += entry.delta,
            BalanceBucket::Locked => locked += entry.delta,
        }
        let op = ops
            .entry(&entry.idempotency_key)
            .or_insert((Decimal::ZERO, entry.subtype.is_external_flow()));
        op.0 += entry.delta;
    }

    let row = format!("{}/{}", history.user_id, history.asset);
    if available != history.balance.available || locked != history.balance.locked {
        return Err(TallyError::InvariantViolation {
            reason: format!(
                "{row}: balance ({}, {}) != fold of log ({available}, {locked})",
                history.balance.available, history.balance.locked
            ),
        });
    }

    if ops.len() as u64 != history.balance.version {
        return Err(TallyError::InvariantViolation {
            reason: format!(
                "{row}: version {} but {} operations logged",
                history.balance.version,
                ops.len()
            ),
        });
    }

    if let Some((key, (net, _))) = ops
        .iter()
        .find(|(_, (net, external))| !external && !net.is_zero())
    {
        return Err(TallyError::InvariantViolation {
            reason: format!("{row}: internal operation {key} nets to {net}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LockManager;
    use std::sync::Arc;
    use tally_types::{CommitmentRef, OrderId, UserId, WithdrawalId};

    #[test]
    fn empty_store_passes() {
        let report = audit(&LedgerStore::new()).unwrap();
        assert_eq!(report.rows_checked, 0);
        assert!(report.supply.is_empty());
    }

    #[test]
    fn lock_cycle_is_conserved() {
        let lm = LockManager::new(Arc::new(LedgerStore::new()));
        let user = UserId::new();
        lm.deposit(user, "USDT", Decimal::new(1000, 0), "d1").unwrap();

        let order = CommitmentRef::Order(OrderId::new());
        lm.lock(user, "USDT", Decimal::new(300, 0), order).unwrap();
        lm.release(user, "USDT", Decimal::new(100, 0), order).unwrap();

        let wd = CommitmentRef::Withdrawal(WithdrawalId::new());
        lm.lock(user, "USDT", Decimal::new(250, 0), wd).unwrap();
        lm.settle(user, "USDT", Decimal::new(250, 0), wd).unwrap();

        let report = audit(lm.store()).unwrap();
        let usdt = &report.supply["USDT"];
        assert_eq!(usdt.inflows, Decimal::new(1000, 0));
        assert_eq!(usdt.outflows, Decimal::new(250, 0));
        assert_eq!(usdt.held, Decimal::new(750, 0));
        assert_eq!(report.rows_checked, 1);
        assert_eq!(report.entries_checked, 8);
    }

    #[test]
    fn assets_are_tracked_independently() {
        let lm = LockManager::new(Arc::new(LedgerStore::new()));
        lm.deposit(UserId::new(), "BTC", Decimal::new(5, 0), "b").unwrap();
        lm.deposit(UserId::new(), "USDT", Decimal::new(50_000, 0), "u").unwrap();

        let report = audit(lm.store()).unwrap();
        assert_eq!(report.supply.len(), 2);
        assert!(report.supply.values().all(AssetSupply::is_conserved));
    }

    #[test]
    fn supply_mismatch_detected() {
        let supply = AssetSupply {
            inflows: Decimal::new(10, 0),
            outflows: Decimal::ZERO,
            held: Decimal::new(11, 0),
        };
        assert!(!supply.is_conserved());
    }
}
