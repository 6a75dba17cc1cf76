//! Lock manager: moves funds between `available` and `locked` on behalf of
//! orders, withdrawal requests and settlement legs.
//!
//! `lock` takes funds out of `available` under a commitment. When that
//! commitment resolves, `release` returns them (cancelled/expired) or
//! `settle` removes them from the user's total (fulfilled). Each call is
//! one idempotent log write keyed by the commitment, so retries are safe.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tally_types::{
    BalanceBucket, CommitmentRef, IdempotencyKey, LockRecord, LockResult, Posting, Result,
    TallyError, TransactionReceipt, TxSubtype, UserId,
};

use crate::store::{LedgerStore, RowWrite};

/// How a lock is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Release,
    Settle,
}

impl Resolution {
    fn key(self, commitment: &CommitmentRef, part: Option<&str>) -> IdempotencyKey {
        let op = match self {
            Self::Release => "release",
            Self::Settle => "settle",
        };
        match part {
            Some(part) => IdempotencyKey::new(format!("{op}:{commitment}:{part}")),
            None => IdempotencyKey::new(format!("{op}:{commitment}")),
        }
    }

    fn subtype(self) -> TxSubtype {
        match self {
            Self::Release => TxSubtype::LockRelease,
            Self::Settle => TxSubtype::LockSettle,
        }
    }

    fn postings(self, amount: Decimal) -> Vec<Posting> {
        match self {
            Self::Release => {
                Posting::transfer(BalanceBucket::Locked, BalanceBucket::Available, amount).to_vec()
            }
            Self::Settle => vec![Posting::new(BalanceBucket::Locked, -amount)],
        }
    }
}

/// Lock/release/settle front-end over a shared [`LedgerStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<LedgerStore>,
}

impl LockManager {
    #[must_use]
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Move `amount` from `available` to `locked` under `commitment`.
    ///
    /// # Errors
    /// - `InvalidAmount` if `amount` is not positive
    /// - `InsufficientBalance` if `available < amount`; nothing changes
    pub fn lock(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        commitment: CommitmentRef,
    ) -> Result<LockResult> {
        ensure_positive(amount)?;
        let key = IdempotencyKey::new(format!("lock:{commitment}"));

        let receipt = self.store.transact(user_id, asset, &key, None, |_| {
            let record = LockRecord::new(commitment, amount, Utc::now());
            Ok(RowWrite::new(
                commitment.lock_subtype(),
                Posting::transfer(BalanceBucket::Available, BalanceBucket::Locked, amount),
            )
            .with_metadata(json!({ "commitment": commitment }))
            .with_lock(record))
        })?;

        Ok(LockResult {
            commitment,
            applied: receipt.applied,
            balance: receipt.balance,
        })
    }

    /// Return `amount` of a commitment's lock to `available`.
    ///
    /// # Errors
    /// - `CommitmentNotFound` if nothing was locked under `commitment`
    /// - `InsufficientBalance` (locked) if `amount` exceeds what remains
    pub fn release(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        commitment: CommitmentRef,
    ) -> Result<LockResult> {
        ensure_positive(amount)?;
        self.resolve(Resolution::Release, user_id, asset, Some(amount), commitment, None)
    }

    /// Finalize `amount` of a commitment's lock into a debit.
    ///
    /// # Errors
    /// As for [`release`](Self::release).
    pub fn settle(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        commitment: CommitmentRef,
    ) -> Result<LockResult> {
        ensure_positive(amount)?;
        self.resolve(Resolution::Settle, user_id, asset, Some(amount), commitment, None)
    }

    /// Release one slice of a commitment, e.g. the unfilled remainder of
    /// a partially filled order. `part` distinguishes slices.
    pub fn release_part(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        commitment: CommitmentRef,
        part: &str,
    ) -> Result<LockResult> {
        ensure_positive(amount)?;
        self.resolve(Resolution::Release, user_id, asset, Some(amount), commitment, Some(part))
    }

    /// Settle one slice of a commitment, e.g. a single fill.
    pub fn settle_part(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        commitment: CommitmentRef,
        part: &str,
    ) -> Result<LockResult> {
        ensure_positive(amount)?;
        self.resolve(Resolution::Settle, user_id, asset, Some(amount), commitment, Some(part))
    }

    /// Release whatever is still outstanding under `commitment`.
    pub fn release_outstanding(
        &self,
        user_id: UserId,
        asset: &str,
        commitment: CommitmentRef,
    ) -> Result<LockResult> {
        self.resolve(Resolution::Release, user_id, asset, None, commitment, None)
    }

    /// Settle whatever is still outstanding under `commitment`.
    pub fn settle_outstanding(
        &self,
        user_id: UserId,
        asset: &str,
        commitment: CommitmentRef,
    ) -> Result<LockResult> {
        self.resolve(Resolution::Settle, user_id, asset, None, commitment, None)
    }

    /// Credit an external deposit to `available`.
    pub fn deposit(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransactionReceipt> {
        ensure_positive(amount)?;
        self.store.record_transaction(
            user_id,
            asset,
            BalanceBucket::Available,
            amount,
            TxSubtype::Deposit,
            &IdempotencyKey::new(format!("deposit:{reference}")),
            json!({ "reference": reference }),
        )
    }

    /// Debit `available` directly, without going through a lock.
    pub fn withdraw_available(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransactionReceipt> {
        ensure_positive(amount)?;
        self.store.record_transaction(
            user_id,
            asset,
            BalanceBucket::Available,
            -amount,
            TxSubtype::Withdrawal,
            &IdempotencyKey::new(format!("withdrawal:{reference}")),
            json!({ "reference": reference }),
        )
    }

    #[must_use]
    pub fn lock_record(
        &self,
        user_id: UserId,
        asset: &str,
        commitment: &CommitmentRef,
    ) -> Option<LockRecord> {
        self.store.lock_record(user_id, asset, commitment)
    }

    fn resolve(
        &self,
        resolution: Resolution,
        user_id: UserId,
        asset: &str,
        amount: Option<Decimal>,
        commitment: CommitmentRef,
        part: Option<&str>,
    ) -> Result<LockResult> {
        let key = resolution.key(&commitment, part);

        let receipt = self.store.transact(user_id, asset, &key, None, |row| {
            let record = row
                .lock_record(&commitment)
                .ok_or_else(|| TallyError::CommitmentNotFound {
                    user: user_id,
                    asset: asset.to_string(),
                    commitment,
                })?;

            let outstanding = record.outstanding();
            let amount = amount.unwrap_or(outstanding);
            if amount > outstanding {
                return Err(TallyError::InsufficientBalance {
                    bucket: BalanceBucket::Locked,
                    needed: amount,
                    available: outstanding,
                });
            }

            let mut updated = record.clone();
            match resolution {
                Resolution::Release => updated.released += amount,
                Resolution::Settle => updated.settled += amount,
            }
            updated.updated_at = Utc::now();

            Ok(RowWrite::new(resolution.subtype(), resolution.postings(amount))
                .with_metadata(json!({ "commitment": commitment, "part": part }))
                .with_lock(updated))
        })?;

        Ok(LockResult {
            commitment,
            applied: receipt.applied,
            balance: receipt.balance,
        })
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(TallyError::InvalidAmount {
            reason: format!("amount must be positive, got {amount}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::{OrderId, WithdrawalId};

    fn setup() -> (LockManager, UserId) {
        let lm = LockManager::new(Arc::new(LedgerStore::new()));
        let user = UserId::new();
        lm.deposit(user, "USDT", Decimal::new(100, 0), "seed").unwrap();
        (lm, user)
    }

    #[test]
    fn lock_then_release_restores_available() {
        let (lm, user) = setup();
        let order = CommitmentRef::Order(OrderId::new());

        let locked = lm.lock(user, "USDT", Decimal::new(30, 0), order).unwrap();
        assert!(locked.applied);
        assert_eq!(locked.balance.available, Decimal::new(70, 0));
        assert_eq!(locked.balance.locked, Decimal::new(30, 0));

        let released = lm.release(user, "USDT", Decimal::new(30, 0), order).unwrap();
        assert_eq!(released.balance.available, Decimal::new(100, 0));
        assert_eq!(released.balance.locked, Decimal::ZERO);
        assert!(!lm.lock_record(user, "USDT", &order).unwrap().is_open());
    }

    #[test]
    fn lock_above_available_changes_nothing() {
        let (lm, user) = setup();
        let before = lm.store().balance(user, "USDT");

        let err = lm
            .lock(user, "USDT", Decimal::new(101, 0), CommitmentRef::Order(OrderId::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            TallyError::InsufficientBalance { bucket: BalanceBucket::Available, .. }
        ));
        assert_eq!(lm.store().balance(user, "USDT"), before);
    }

    #[test]
    fn retried_lock_applies_once() {
        let (lm, user) = setup();
        let order = CommitmentRef::Order(OrderId::new());
        lm.lock(user, "USDT", Decimal::new(30, 0), order).unwrap();
        let retry = lm.lock(user, "USDT", Decimal::new(30, 0), order).unwrap();

        assert!(!retry.applied);
        assert_eq!(lm.store().balance(user, "USDT").locked, Decimal::new(30, 0));
    }

    #[test]
    fn settle_removes_funds_from_total() {
        let (lm, user) = setup();
        let wd = CommitmentRef::Withdrawal(WithdrawalId::new());
        lm.lock(user, "USDT", Decimal::new(40, 0), wd).unwrap();
        let settled = lm.settle(user, "USDT", Decimal::new(40, 0), wd).unwrap();

        assert_eq!(settled.balance.available, Decimal::new(60, 0));
        assert_eq!(settled.balance.locked, Decimal::ZERO);
        assert_eq!(settled.balance.total(), Decimal::new(60, 0));
    }

    #[test]
    fn release_unknown_commitment_fails() {
        let (lm, user) = setup();
        let err = lm
            .release(user, "USDT", Decimal::ONE, CommitmentRef::Order(OrderId::new()))
            .unwrap_err();
        assert!(matches!(err, TallyError::CommitmentNotFound { .. }));
    }

    #[test]
    fn release_more_than_outstanding_fails() {
        let (lm, user) = setup();
        let order = CommitmentRef::Order(OrderId::new());
        lm.lock(user, "USDT", Decimal::new(10, 0), order).unwrap();

        let err = lm.release(user, "USDT", Decimal::new(11, 0), order).unwrap_err();
        assert!(matches!(
            err,
            TallyError::InsufficientBalance { bucket: BalanceBucket::Locked, .. }
        ));
        assert_eq!(lm.store().balance(user, "USDT").locked, Decimal::new(10, 0));
    }

    #[test]
    fn partial_fills_then_release_remainder() {
        let (lm, user) = setup();
        let order = CommitmentRef::Order(OrderId::new());
        lm.lock(user, "USDT", Decimal::new(50, 0), order).unwrap();

        lm.settle_part(user, "USDT", Decimal::new(20, 0), order, "fill-1").unwrap();
        lm.settle_part(user, "USDT", Decimal::new(10, 0), order, "fill-2").unwrap();
        // Retried fill is a no-op.
        lm.settle_part(user, "USDT", Decimal::new(10, 0), order, "fill-2").unwrap();

        let rest = lm.release_outstanding(user, "USDT", order).unwrap();
        assert_eq!(rest.balance.locked, Decimal::ZERO);
        assert_eq!(rest.balance.available, Decimal::new(70, 0));

        let record = lm.lock_record(user, "USDT", &order).unwrap();
        assert_eq!(record.settled, Decimal::new(30, 0));
        assert_eq!(record.released, Decimal::new(20, 0));
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let (lm, user) = setup();
        let order = CommitmentRef::Order(OrderId::new());
        assert!(matches!(
            lm.lock(user, "USDT", Decimal::ZERO, order),
            Err(TallyError::InvalidAmount { .. })
        ));
        assert!(matches!(
            lm.deposit(user, "USDT", Decimal::new(-5, 0), "neg"),
            Err(TallyError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn lock_entries_share_one_key() {
        let (lm, user) = setup();
        let order = CommitmentRef::Order(OrderId::new());
        lm.lock(user, "USDT", Decimal::new(5, 0), order).unwrap();

        let entries = lm.store().entries(user, "USDT");
        let lock_entries: Vec<_> = entries
            .iter()
            .filter(|e| e.subtype == TxSubtype::OrderLock)
            .collect();
        assert_eq!(lock_entries.len(), 2);
        assert_eq!(lock_entries[0].idempotency_key, lock_entries[1].idempotency_key);
        assert_eq!(lock_entries[0].delta + lock_entries[1].delta, Decimal::ZERO);
    }
}
