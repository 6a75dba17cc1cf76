//! Balance store and transaction log.
//!
//! Tracks per-(user, asset) balance rows and their append-only log. Every
//! mutation runs while holding the exclusive lock of the row it touches:
//! the idempotency check, the sufficiency check and the write all happen
//! inside that one critical section, so no interleaved change to the same
//! row is observable. Either the whole operation is applied or nothing is.
//!
//! Lock order is always row → idempotency index, never the reverse.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tally_types::{
    Asset, BalanceBucket, BalanceRow, CommitmentRef, EntryId, IdempotencyKey, LockRecord,
    LogEntry, Posting, Result, TallyError, TransactionReceipt, TxSubtype, UserId,
};
use tracing::{debug, info};

type RowKey = (UserId, Asset);

#[derive(Debug, Default)]
struct RowState {
    balance: BalanceRow,
    locks: BTreeMap<CommitmentRef, LockRecord>,
    entries: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
struct StoredReceipt {
    user_id: UserId,
    asset: Asset,
    balance: BalanceRow,
}

/// Read-only view of a row, handed to a write builder while the row lock
/// is held.
pub struct RowView<'a> {
    state: &'a RowState,
}

impl RowView<'_> {
    #[must_use]
    pub fn balance(&self) -> &BalanceRow {
        &self.state.balance
    }

    #[must_use]
    pub fn lock_record(&self, commitment: &CommitmentRef) -> Option<&LockRecord> {
        self.state.locks.get(commitment)
    }

    pub fn lock_records(&self) -> impl Iterator<Item = &LockRecord> {
        self.state.locks.values()
    }
}

/// A staged change to one row: the postings to log plus any lock-record
/// bookkeeping that must commit together with them.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub subtype: TxSubtype,
    pub postings: Vec<Posting>,
    pub metadata: serde_json::Value,
    pub lock_updates: Vec<LockRecord>,
}

impl RowWrite {
    #[must_use]
    pub fn new(subtype: TxSubtype, postings: impl IntoIterator<Item = Posting>) -> Self {
        Self {
            subtype,
            postings: postings.into_iter().collect(),
            metadata: serde_json::Value::Null,
            lock_updates: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_lock(mut self, record: LockRecord) -> Self {
        self.lock_updates.push(record);
        self
    }
}

/// Consistent copy of a row taken under its lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSnapshot {
    pub balance: BalanceRow,
    pub locks: Vec<LockRecord>,
}

/// A row with its full log.
#[derive(Debug, Clone)]
pub struct RowHistory {
    pub user_id: UserId,
    pub asset: Asset,
    pub balance: BalanceRow,
    pub entries: Vec<LogEntry>,
}

/// The balance store: source of truth for all balance rows and their log.
#[derive(Default)]
pub struct LedgerStore {
    rows: RwLock<HashMap<RowKey, Arc<Mutex<RowState>>>>,
    receipts: Mutex<HashMap<IdempotencyKey, StoredReceipt>>,
}

impl LedgerStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single-bucket mutation.
    ///
    /// A key seen before makes this a no-op that returns the balance
    /// computed by the original call.
    ///
    /// # Errors
    /// - `InsufficientBalance` if `delta` would drive `bucket` below zero
    /// - `InvalidAmount` if `delta` is zero
    #[allow(clippy::too_many_arguments)]
    pub fn record_transaction(
        &self,
        user_id: UserId,
        asset: &str,
        bucket: BalanceBucket,
        delta: Decimal,
        subtype: TxSubtype,
        key: &IdempotencyKey,
        metadata: serde_json::Value,
    ) -> Result<TransactionReceipt> {
        self.transact(user_id, asset, key, None, |_| {
            Ok(RowWrite::new(subtype, [Posting::new(bucket, delta)]).with_metadata(metadata))
        })
    }

    /// Record a multi-bucket mutation as one operation.
    ///
    /// With `expected_version`, the write only lands if the row has not
    /// changed since it was read.
    ///
    /// # Errors
    /// - `ReconciliationConflict` if the row version moved on
    /// - `InsufficientBalance` / `InvalidAmount` as for
    ///   [`record_transaction`](Self::record_transaction)
    #[allow(clippy::too_many_arguments)]
    pub fn apply_postings(
        &self,
        user_id: UserId,
        asset: &str,
        postings: &[Posting],
        subtype: TxSubtype,
        key: &IdempotencyKey,
        metadata: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<TransactionReceipt> {
        self.transact(user_id, asset, key, expected_version, |_| {
            Ok(RowWrite::new(subtype, postings.iter().copied()).with_metadata(metadata))
        })
    }

    /// Run `build` against the locked row and commit what it stages.
    ///
    /// `build` is not called for a replayed key. Anything it returns is
    /// validated as a whole before a single entry is written.
    pub fn transact<F>(
        &self,
        user_id: UserId,
        asset: &str,
        key: &IdempotencyKey,
        expected_version: Option<u64>,
        build: F,
    ) -> Result<TransactionReceipt>
    where
        F: FnOnce(&RowView<'_>) -> Result<RowWrite>,
    {
        let row = self.row_or_create(user_id, asset);
        let mut state = row.lock();

        if let Some(prior) = self.receipts.lock().get(key) {
            debug!(key = %key, user = %user_id, asset, "Replay of applied operation");
            return Ok(replayed(prior));
        }

        if let Some(expected) = expected_version {
            if state.balance.version != expected {
                return Err(TallyError::ReconciliationConflict {
                    user: user_id,
                    asset: asset.to_string(),
                    expected,
                    found: state.balance.version,
                });
            }
        }

        let write = build(&RowView { state: &state })?;
        let next = stage(&state.balance, &write.postings)?;

        match self.receipts.lock().entry(key.clone()) {
            Entry::Occupied(prior) => return Ok(replayed(prior.get())),
            Entry::Vacant(slot) => {
                slot.insert(StoredReceipt {
                    user_id,
                    asset: asset.to_string(),
                    balance: next.clone(),
                });
            }
        }

        let now = Utc::now();
        for posting in write.postings.iter().filter(|p| !p.delta.is_zero()) {
            state.entries.push(LogEntry {
                entry_id: EntryId::new(),
                idempotency_key: key.clone(),
                user_id,
                asset: asset.to_string(),
                bucket: posting.bucket,
                delta: posting.delta,
                subtype: write.subtype,
                metadata: write.metadata.clone(),
                created_at: now,
            });
        }
        for record in write.lock_updates {
            state.locks.insert(record.commitment, record);
        }
        state.balance = next.clone();

        info!(
            key = %key,
            user = %user_id,
            asset,
            subtype = %write.subtype,
            available = %next.available,
            locked = %next.locked,
            version = next.version,
            "Transaction applied"
        );

        Ok(TransactionReceipt {
            applied: true,
            balance: next,
        })
    }

    /// Get the balance for a (user, asset) pair.
    #[must_use]
    pub fn balance(&self, user_id: UserId, asset: &str) -> BalanceRow {
        self.row(user_id, asset)
            .map(|row| row.lock().balance.clone())
            .unwrap_or_default()
    }

    /// Balance plus lock records, read atomically.
    #[must_use]
    pub fn snapshot(&self, user_id: UserId, asset: &str) -> RowSnapshot {
        self.row(user_id, asset)
            .map(|row| {
                let state = row.lock();
                RowSnapshot {
                    balance: state.balance.clone(),
                    locks: state.locks.values().cloned().collect(),
                }
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn lock_record(
        &self,
        user_id: UserId,
        asset: &str,
        commitment: &CommitmentRef,
    ) -> Option<LockRecord> {
        self.row(user_id, asset)
            .and_then(|row| row.lock().locks.get(commitment).cloned())
    }

    /// Log entries of one row, oldest first.
    #[must_use]
    pub fn entries(&self, user_id: UserId, asset: &str) -> Vec<LogEntry> {
        self.row(user_id, asset)
            .map(|row| row.lock().entries.clone())
            .unwrap_or_default()
    }

    /// Every (user, asset) pair that has a row.
    #[must_use]
    pub fn row_keys(&self) -> Vec<(UserId, Asset)> {
        let mut keys: Vec<_> = self.rows.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Rows whose locked bucket exceeds `epsilon`.
    #[must_use]
    pub fn locked_rows(&self, epsilon: Decimal) -> Vec<(UserId, Asset, BalanceRow)> {
        self.row_keys()
            .into_iter()
            .filter_map(|(user, asset)| {
                let balance = self.balance(user, &asset);
                (balance.locked > epsilon).then_some((user, asset, balance))
            })
            .collect()
    }

    /// Whether an operation with `key` has been applied.
    #[must_use]
    pub fn has_applied(&self, key: &IdempotencyKey) -> bool {
        self.receipts.lock().contains_key(key)
    }

    /// Total number of log entries across all rows.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.all_rows().iter().map(|row| row.lock().entries.len()).sum()
    }

    /// Total supply of an asset (sum of all users' available + locked).
    #[must_use]
    pub fn total_supply(&self, asset: &str) -> Decimal {
        self.row_keys()
            .into_iter()
            .filter(|(_, a)| a == asset)
            .map(|(user, a)| self.balance(user, &a).total())
            .sum()
    }

    /// Each row's balance together with its log, read under the row lock.
    #[must_use]
    pub fn histories(&self) -> Vec<RowHistory> {
        self.row_keys()
            .into_iter()
            .filter_map(|(user_id, asset)| {
                let row = self.row(user_id, &asset)?;
                let state = row.lock();
                Some(RowHistory {
                    user_id,
                    asset,
                    balance: state.balance.clone(),
                    entries: state.entries.clone(),
                })
            })
            .collect()
    }

    fn row(&self, user_id: UserId, asset: &str) -> Option<Arc<Mutex<RowState>>> {
        self.rows.read().get(&(user_id, asset.to_string())).cloned()
    }

    fn row_or_create(&self, user_id: UserId, asset: &str) -> Arc<Mutex<RowState>> {
        if let Some(row) = self.row(user_id, asset) {
            return row;
        }
        self.rows
            .write()
            .entry((user_id, asset.to_string()))
            .or_default()
            .clone()
    }

    fn all_rows(&self) -> Vec<Arc<Mutex<RowState>>> {
        self.rows.read().values().cloned().collect()
    }
}

fn replayed(prior: &StoredReceipt) -> TransactionReceipt {
    debug!(user = %prior.user_id, asset = %prior.asset, "Returning prior receipt");
    TransactionReceipt {
        applied: false,
        balance: prior.balance.clone(),
    }
}

/// Apply `postings` to a copy of `current`, rejecting any negative bucket.
fn stage(current: &BalanceRow, postings: &[Posting]) -> Result<BalanceRow> {
    if postings.iter().all(|p| p.delta.is_zero()) {
        return Err(TallyError::InvalidAmount {
            reason: "operation has no effect".into(),
        });
    }

    let mut next = current.clone();
    for posting in postings {
        next.apply(posting.bucket, posting.delta);
    }

    for bucket in [BalanceBucket::Available, BalanceBucket::Locked] {
        if next.bucket(bucket) < Decimal::ZERO {
            let needed: Decimal = postings
                .iter()
                .filter(|p| p.bucket == bucket && p.delta < Decimal::ZERO)
                .map(|p| -p.delta)
                .sum();
            return Err(TallyError::InsufficientBalance {
                bucket,
                needed,
                available: current.bucket(bucket),
            });
        }
    }

    next.version += 1;
    Ok(next)
}
