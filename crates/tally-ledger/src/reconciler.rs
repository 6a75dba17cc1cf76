//! Reconciler ("auto-heal") for orphaned locks.
//!
//! Compares each row's locked bucket with the commitments that should be
//! backing it and moves the difference back to `available` with a single
//! `reconciliation-fix` operation. No lock is held across a scan: every
//! correction re-reads the row and the commitments, and the write only
//! lands if the row version is unchanged since that read. A conflicting
//! write is retried, then deferred to the next pass.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tally_types::{
    BalanceBucket, BalanceRow, CommitmentRef, IdempotencyKey, LockRecord, OpenOrder,
    PendingWithdrawal, Posting, ReconcilerConfig, Result, TallyError, TransactionReceipt, TxSubtype,
    UserId,
};
use tracing::{debug, info, warn};

use crate::store::{LedgerStore, RowSnapshot, RowWrite};

/// Where open commitments live. Owned by the order and withdrawal
/// subsystems; the reconciler only reads.
pub trait CommitmentSource: Send + Sync {
    /// All of the user's open orders, any market.
    fn open_orders(&self, user_id: UserId) -> Result<Vec<OpenOrder>>;

    /// The user's withdrawal requests for `asset`.
    fn pending_withdrawals(&self, user_id: UserId, asset: &str) -> Result<Vec<PendingWithdrawal>>;
}

/// A corrective write that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub key: IdempotencyKey,
    pub locked_before: Decimal,
    pub expected_locked: Decimal,
    /// `locked_before - expected_locked`; positive when over-locked.
    pub discrepancy: Decimal,
    pub balance: BalanceRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Consistent,
    Corrected(Correction),
    /// Commitments need more than is locked. Reported, not repaired.
    UnderLocked {
        locked: Decimal,
        expected_locked: Decimal,
        shortfall: Decimal,
    },
    /// Today's fix for this row was already written.
    AlreadyCorrected,
    /// The row kept changing under the recheck; left for the next pass.
    Deferred { attempts: u32 },
}

/// Tally of one `reconcile_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub inspected: usize,
    pub consistent: usize,
    pub corrected: usize,
    pub under_locked: usize,
    pub already_corrected: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Net amount moved from `locked` back to `available`.
    pub net_released: Decimal,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Consistent => self.consistent += 1,
            ReconcileOutcome::Corrected(c) => {
                self.corrected += 1;
                self.net_released += c.discrepancy;
            }
            ReconcileOutcome::UnderLocked { .. } => self.under_locked += 1,
            ReconcileOutcome::AlreadyCorrected => self.already_corrected += 1,
            ReconcileOutcome::Deferred { .. } => self.deferred += 1,
        }
    }
}

/// What a row's locked bucket should hold, and how much each live
/// commitment still accounts for.
struct Expectation {
    locked: Decimal,
    backed: HashMap<CommitmentRef, Decimal>,
}

pub struct Reconciler {
    store: Arc<LedgerStore>,
    source: Arc<dyn CommitmentSource>,
    config: ReconcilerConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        source: Arc<dyn CommitmentSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Check one row and repair it if it holds orphaned funds.
    ///
    /// # Errors
    /// Only collaborator or store failures; conflicts are retried.
    pub fn reconcile(&self, user_id: UserId, asset: &str) -> Result<ReconcileOutcome> {
        self.reconcile_at(user_id, asset, Utc::now())
    }

    /// [`reconcile`](Self::reconcile) with an explicit clock. The day of
    /// `now` selects the idempotency key of the fix.
    pub fn reconcile_at(
        &self,
        user_id: UserId,
        asset: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let key = IdempotencyKey::new(format!(
            "reconcile:{user_id}:{asset}:{}",
            now.format("%Y-%m-%d")
        ));
        let mut attempts = 0u32;

        loop {
            let snapshot = self.store.snapshot(user_id, asset);
            let expected = self.expectation(user_id, asset, &snapshot)?;
            let locked = snapshot.balance.locked;
            let discrepancy = locked - expected.locked;

            if discrepancy.abs() <= self.config.epsilon {
                debug!(user = %user_id, asset, %locked, "Row consistent");
                return Ok(ReconcileOutcome::Consistent);
            }

            if discrepancy < Decimal::ZERO {
                let shortfall = -discrepancy;
                if !self.config.correct_under_locked || snapshot.balance.available < shortfall {
                    warn!(
                        user = %user_id,
                        asset,
                        %locked,
                        expected = %expected.locked,
                        "Locked balance below open commitments"
                    );
                    return Ok(ReconcileOutcome::UnderLocked {
                        locked,
                        expected_locked: expected.locked,
                        shortfall,
                    });
                }
            } else {
                warn!(
                    user = %user_id,
                    asset,
                    %locked,
                    expected = %expected.locked,
                    orphaned = %discrepancy,
                    "Orphaned lock detected"
                );
            }

            match self.write_fix(user_id, asset, &key, &snapshot, &expected, discrepancy) {
                Ok(receipt) if receipt.applied => {
                    info!(
                        user = %user_id,
                        asset,
                        key = %key,
                        %discrepancy,
                        locked = %receipt.balance.locked,
                        available = %receipt.balance.available,
                        "Reconciliation correction applied"
                    );
                    return Ok(ReconcileOutcome::Corrected(Correction {
                        key,
                        locked_before: locked,
                        expected_locked: expected.locked,
                        discrepancy,
                        balance: receipt.balance,
                    }));
                }
                Ok(_) => {
                    debug!(user = %user_id, asset, key = %key, "Row already corrected today");
                    return Ok(ReconcileOutcome::AlreadyCorrected);
                }
                Err(TallyError::ReconciliationConflict { expected, found, .. }) => {
                    attempts += 1;
                    warn!(
                        user = %user_id,
                        asset,
                        expected,
                        found,
                        attempts,
                        "Row changed during reconciliation"
                    );
                    if attempts > self.config.max_conflict_retries {
                        return Ok(ReconcileOutcome::Deferred { attempts });
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reconcile every row whose locked bucket exceeds epsilon.
    ///
    /// A failing row is counted and logged; the pass carries on.
    pub fn reconcile_all(&self) -> ReconcileSummary {
        let now = Utc::now();
        let mut summary = ReconcileSummary::default();

        for (user_id, asset, _) in self.store.locked_rows(self.config.epsilon) {
            summary.inspected += 1;
            match self.reconcile_at(user_id, &asset, now) {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    summary.failed += 1;
                    warn!(user = %user_id, asset = %asset, error = %err, "Reconciliation failed");
                }
            }
        }

        info!(
            inspected = summary.inspected,
            corrected = summary.corrected,
            under_locked = summary.under_locked,
            deferred = summary.deferred,
            failed = summary.failed,
            "Reconciliation pass complete"
        );
        summary
    }

    fn expectation(&self, user_id: UserId, asset: &str, snapshot: &RowSnapshot) -> Result<Expectation> {
        let mut locked = Decimal::ZERO;
        let mut backed: HashMap<CommitmentRef, Decimal> = HashMap::new();

        for order in self.source.open_orders(user_id)? {
            let holding = order.holding_of(asset);
            if holding > Decimal::ZERO {
                locked += holding;
                *backed.entry(CommitmentRef::Order(order.order_id)).or_default() += holding;
            }
        }

        for withdrawal in self.source.pending_withdrawals(user_id, asset)? {
            if withdrawal.asset == asset && withdrawal.status.holds_funds() {
                locked += withdrawal.amount;
                *backed
                    .entry(CommitmentRef::Withdrawal(withdrawal.withdrawal_id))
                    .or_default() += withdrawal.amount;
            }
        }

        // Settlement collateral is owned by the ledger itself.
        for record in &snapshot.locks {
            if matches!(record.commitment, CommitmentRef::Settlement(_)) && record.is_open() {
                locked += record.outstanding();
                backed.insert(record.commitment, record.outstanding());
            }
        }

        Ok(Expectation { locked, backed })
    }

    fn write_fix(
        &self,
        user_id: UserId,
        asset: &str,
        key: &IdempotencyKey,
        snapshot: &RowSnapshot,
        expected: &Expectation,
        discrepancy: Decimal,
    ) -> Result<TransactionReceipt> {
        let postings = if discrepancy > Decimal::ZERO {
            Posting::transfer(BalanceBucket::Locked, BalanceBucket::Available, discrepancy)
        } else {
            Posting::transfer(BalanceBucket::Available, BalanceBucket::Locked, -discrepancy)
        };
        let metadata = json!({
            "locked_before": snapshot.balance.locked,
            "expected_locked": expected.locked,
            "discrepancy": discrepancy,
        });

        self.store.transact(
            user_id,
            asset,
            key,
            Some(snapshot.balance.version),
            |row| {
                let mut write = RowWrite::new(TxSubtype::ReconciliationFix, postings)
                    .with_metadata(metadata);
                if discrepancy > Decimal::ZERO {
                    let now = Utc::now();
                    for record in row.lock_records().filter(|r| r.is_open()) {
                        let backing = expected
                            .backed
                            .get(&record.commitment)
                            .copied()
                            .unwrap_or_default();
                        if record.outstanding() > backing {
                            write = write.with_lock(trim(record, backing, now));
                        }
                    }
                }
                Ok(write)
            },
        )
    }
}

/// Release whatever a lock record holds beyond `backing`. A record with
/// no live commitment behind it (`backing` zero) ends up closed.
fn trim(record: &LockRecord, backing: Decimal, now: DateTime<Utc>) -> LockRecord {
    let mut trimmed = record.clone();
    trimmed.released += trimmed.outstanding() - backing;
    trimmed.updated_at = now;
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LockManager;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tally_types::{OrderId, OrderSide, WithdrawalId};

    #[derive(Default)]
    struct StaticCommitments {
        orders: Mutex<HashMap<UserId, Vec<OpenOrder>>>,
        withdrawals: Mutex<HashMap<UserId, Vec<PendingWithdrawal>>>,
    }

    impl CommitmentSource for StaticCommitments {
        fn open_orders(&self, user_id: UserId) -> Result<Vec<OpenOrder>> {
            Ok(self.orders.lock().get(&user_id).cloned().unwrap_or_default())
        }

        fn pending_withdrawals(&self, user_id: UserId, _asset: &str) -> Result<Vec<PendingWithdrawal>> {
            Ok(self.withdrawals.lock().get(&user_id).cloned().unwrap_or_default())
        }
    }

    /// Deposits into the row it is asked about, simulating live traffic
    /// landing between the reconciler's read and its write.
    struct BusyRow {
        store: Arc<LedgerStore>,
        interruptions: u32,
        calls: AtomicU32,
    }

    impl CommitmentSource for BusyRow {
        fn open_orders(&self, user_id: UserId) -> Result<Vec<OpenOrder>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.interruptions {
                self.store.record_transaction(
                    user_id,
                    "USDT",
                    BalanceBucket::Available,
                    Decimal::ONE,
                    TxSubtype::Deposit,
                    &IdempotencyKey::new(format!("busy-{n}")),
                    serde_json::Value::Null,
                )?;
            }
            Ok(Vec::new())
        }

        fn pending_withdrawals(&self, _: UserId, _: &str) -> Result<Vec<PendingWithdrawal>> {
            Ok(Vec::new())
        }
    }

    fn setup() -> (LockManager, Arc<StaticCommitments>, Reconciler, UserId) {
        let store = Arc::new(LedgerStore::new());
        let lm = LockManager::new(Arc::clone(&store));
        let source = Arc::new(StaticCommitments::default());
        let rec = Reconciler::new(store, source.clone(), ReconcilerConfig::default());
        let user = UserId::new();
        lm.deposit(user, "USDT", Decimal::new(130, 0), "seed").unwrap();
        (lm, source, rec, user)
    }

    fn orphan(lm: &LockManager, user: UserId, amount: i64) -> CommitmentRef {
        let order = CommitmentRef::Order(OrderId::new());
        lm.lock(user, "USDT", Decimal::new(amount, 0), order).unwrap();
        order
    }

    #[test]
    fn orphaned_lock_returns_to_available() {
        let (lm, _source, rec, user) = setup();
        let order = orphan(&lm, user, 30);

        let outcome = rec.reconcile(user, "USDT").unwrap();
        let ReconcileOutcome::Corrected(fix) = outcome else {
            panic!("expected correction, got {outcome:?}");
        };
        assert_eq!(fix.discrepancy, Decimal::new(30, 0));
        assert_eq!(fix.balance.available, Decimal::new(130, 0));
        assert_eq!(fix.balance.locked, Decimal::ZERO);
        assert!(!lm.lock_record(user, "USDT", &order).unwrap().is_open());
    }

    #[test]
    fn second_pass_is_consistent() {
        let (lm, _source, rec, user) = setup();
        orphan(&lm, user, 30);

        assert!(matches!(
            rec.reconcile(user, "USDT").unwrap(),
            ReconcileOutcome::Corrected(_)
        ));
        assert_eq!(rec.reconcile(user, "USDT").unwrap(), ReconcileOutcome::Consistent);
        assert_eq!(lm.store().balance(user, "USDT").available, Decimal::new(130, 0));
    }

    #[test]
    fn backed_locks_are_left_alone() {
        let (lm, source, rec, user) = setup();
        let order_id = OrderId::new();
        lm.lock(user, "USDT", Decimal::new(50, 0), CommitmentRef::Order(order_id))
            .unwrap();
        let mut order = OpenOrder::dummy_limit(OrderSide::Buy, Decimal::new(25, 0), Decimal::new(2, 0));
        order.order_id = order_id;
        source.orders.lock().insert(user, vec![order]);

        assert_eq!(rec.reconcile(user, "USDT").unwrap(), ReconcileOutcome::Consistent);
    }

    #[test]
    fn partial_orphan_only_moves_the_excess() {
        let (lm, source, rec, user) = setup();
        let wd = PendingWithdrawal::dummy("USDT", Decimal::new(20, 0));
        lm.lock(user, "USDT", Decimal::new(20, 0), CommitmentRef::Withdrawal(wd.withdrawal_id))
            .unwrap();
        orphan(&lm, user, 15);
        source.withdrawals.lock().insert(user, vec![wd]);

        let ReconcileOutcome::Corrected(fix) = rec.reconcile(user, "USDT").unwrap() else {
            panic!("expected correction");
        };
        assert_eq!(fix.discrepancy, Decimal::new(15, 0));
        assert_eq!(fix.balance.locked, Decimal::new(20, 0));
    }

    #[test]
    fn shrunken_order_lock_can_still_settle() {
        let (lm, source, rec, user) = setup();
        let order_id = OrderId::new();
        let commitment = CommitmentRef::Order(order_id);
        lm.lock(user, "USDT", Decimal::new(50, 0), commitment).unwrap();
        // The book now only needs 30 for this order.
        let mut order = OpenOrder::dummy_limit(OrderSide::Buy, Decimal::ONE, Decimal::new(30, 0));
        order.order_id = order_id;
        source.orders.lock().insert(user, vec![order]);

        let ReconcileOutcome::Corrected(fix) = rec.reconcile(user, "USDT").unwrap() else {
            panic!("expected correction");
        };
        assert_eq!(fix.discrepancy, Decimal::new(20, 0));
        let record = lm.lock_record(user, "USDT", &commitment).unwrap();
        assert_eq!(record.outstanding(), Decimal::new(30, 0));

        lm.settle_outstanding(user, "USDT", commitment).unwrap();
        let row = lm.store().balance(user, "USDT");
        assert_eq!((row.available, row.locked), (Decimal::new(100, 0), Decimal::ZERO));
        crate::audit(lm.store()).unwrap();
    }

    #[test]
    fn under_locked_is_reported_only() {
        let (_lm, source, rec, user) = setup();
        let wd = PendingWithdrawal {
            withdrawal_id: WithdrawalId::new(),
            asset: "USDT".into(),
            amount: Decimal::new(10, 0),
            status: tally_types::WithdrawalStatus::Submitted,
        };
        source.withdrawals.lock().insert(user, vec![wd]);

        let outcome = rec.reconcile(user, "USDT").unwrap();
        assert!(matches!(outcome, ReconcileOutcome::UnderLocked { .. }));
        assert_eq!(rec.store.balance(user, "USDT").locked, Decimal::ZERO);
    }

    #[test]
    fn under_locked_repaired_when_enabled() {
        let store = Arc::new(LedgerStore::new());
        let lm = LockManager::new(Arc::clone(&store));
        let user = UserId::new();
        lm.deposit(user, "USDT", Decimal::new(50, 0), "seed").unwrap();

        let source = Arc::new(StaticCommitments::default());
        source
            .withdrawals
            .lock()
            .insert(user, vec![PendingWithdrawal::dummy("USDT", Decimal::new(10, 0))]);
        let config = ReconcilerConfig {
            correct_under_locked: true,
            ..ReconcilerConfig::default()
        };
        let rec = Reconciler::new(Arc::clone(&store), source, config);

        let ReconcileOutcome::Corrected(fix) = rec.reconcile(user, "USDT").unwrap() else {
            panic!("expected correction");
        };
        assert_eq!(fix.discrepancy, Decimal::new(-10, 0));
        assert_eq!(fix.balance.locked, Decimal::new(10, 0));
        assert_eq!(fix.balance.available, Decimal::new(40, 0));
    }

    #[test]
    fn new_orphan_same_day_is_already_corrected() {
        let (lm, _source, rec, user) = setup();
        let now = Utc::now();
        orphan(&lm, user, 10);
        assert!(matches!(
            rec.reconcile_at(user, "USDT", now).unwrap(),
            ReconcileOutcome::Corrected(_)
        ));

        orphan(&lm, user, 5);
        assert_eq!(
            rec.reconcile_at(user, "USDT", now).unwrap(),
            ReconcileOutcome::AlreadyCorrected
        );
        let tomorrow = now + chrono::Duration::days(1);
        assert!(matches!(
            rec.reconcile_at(user, "USDT", tomorrow).unwrap(),
            ReconcileOutcome::Corrected(_)
        ));
    }

    #[test]
    fn conflict_is_retried() {
        let store = Arc::new(LedgerStore::new());
        let lm = LockManager::new(Arc::clone(&store));
        let user = UserId::new();
        lm.deposit(user, "USDT", Decimal::new(100, 0), "seed").unwrap();
        orphan(&lm, user, 30);

        let source = Arc::new(BusyRow {
            store: Arc::clone(&store),
            interruptions: 1,
            calls: AtomicU32::new(0),
        });
        let rec = Reconciler::new(Arc::clone(&store), source, ReconcilerConfig::default());

        let outcome = rec.reconcile(user, "USDT").unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Corrected(_)));
        let bal = store.balance(user, "USDT");
        assert_eq!(bal.locked, Decimal::ZERO);
        assert_eq!(bal.available, Decimal::new(101, 0));
    }

    #[test]
    fn persistent_conflict_is_deferred() {
        let store = Arc::new(LedgerStore::new());
        let lm = LockManager::new(Arc::clone(&store));
        let user = UserId::new();
        lm.deposit(user, "USDT", Decimal::new(100, 0), "seed").unwrap();
        orphan(&lm, user, 30);

        let source = Arc::new(BusyRow {
            store: Arc::clone(&store),
            interruptions: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let config = ReconcilerConfig {
            max_conflict_retries: 2,
            ..ReconcilerConfig::default()
        };
        let rec = Reconciler::new(Arc::clone(&store), source, config);

        assert_eq!(
            rec.reconcile(user, "USDT").unwrap(),
            ReconcileOutcome::Deferred { attempts: 3 }
        );
        assert_eq!(store.balance(user, "USDT").locked, Decimal::new(30, 0));
    }

    #[test]
    fn reconcile_all_counts_outcomes() {
        let (lm, _source, rec, user) = setup();
        orphan(&lm, user, 30);
        let other = UserId::new();
        lm.deposit(other, "BTC", Decimal::new(5, 0), "seed-btc").unwrap();
        lm.lock(other, "BTC", Decimal::new(2, 0), CommitmentRef::Order(OrderId::new()))
            .unwrap();

        let summary = rec.reconcile_all();
        assert_eq!(summary.inspected, 2);
        assert_eq!(summary.corrected, 2);
        assert_eq!(summary.net_released, Decimal::new(32, 0));

        let again = rec.reconcile_all();
        assert_eq!(again.inspected, 0);
    }
}
