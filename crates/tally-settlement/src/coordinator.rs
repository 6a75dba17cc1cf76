//! Two-party settlement coordinator.
//!
//! Each matched trade is settled leg by leg on-chain:
//! 1. `request_settlement` creates one `pending` row per leg and locks the
//!    obligor's collateral for every send leg
//! 2. `report_submission` records the broadcast tx hash (`submitted`)
//! 3. `confirm_settlement` verifies it on-chain (`confirmed`); the leg that
//!    completes the set settles every leg's collateral
//! 4. A failed, rejected or expired leg fails the whole trade: all
//!    collateral still locked goes back to `available`
//!
//! All legs of a trade sit behind one trade lock, so the "every leg
//! confirmed" decision always reads current leg state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tally_ledger::LockManager;
use tally_types::{
    CommitmentRef, Result, SettlementConfig, SettlementLeg, SettlementRequest,
    SettlementRequestId, SettlementStatus, TallyError, TradeId, TradeSettlementState,
};
use tracing::{debug, info, warn};

use crate::verifier::{ChainVerifier, normalize_tx_hash};

#[derive(Debug, Default)]
struct TradeState {
    legs: Vec<SettlementRequest>,
    /// Collateral has been settled or released; nothing left to move.
    finalized: bool,
}

impl TradeState {
    fn leg_mut(&mut self, id: SettlementRequestId) -> Result<&mut SettlementRequest> {
        self.legs
            .iter_mut()
            .find(|leg| leg.id == id)
            .ok_or(TallyError::SettlementNotFound(id))
    }

    fn leg(&self, id: SettlementRequestId) -> Result<&SettlementRequest> {
        self.legs
            .iter()
            .find(|leg| leg.id == id)
            .ok_or(TallyError::SettlementNotFound(id))
    }

    fn status(&self) -> TradeSettlementState {
        if self.legs.iter().any(|leg| leg.status.is_unsuccessful()) {
            TradeSettlementState::Failed
        } else if !self.legs.is_empty()
            && self.legs.iter().all(|leg| leg.status == SettlementStatus::Confirmed)
        {
            TradeSettlementState::Settled
        } else {
            TradeSettlementState::InProgress
        }
    }
}

pub struct SettlementCoordinator {
    locks: LockManager,
    verifier: Arc<dyn ChainVerifier>,
    config: SettlementConfig,
    trades: RwLock<HashMap<TradeId, Arc<Mutex<TradeState>>>>,
    leg_to_trade: RwLock<HashMap<SettlementRequestId, TradeId>>,
}

impl SettlementCoordinator {
    #[must_use]
    pub fn new(
        locks: LockManager,
        verifier: Arc<dyn ChainVerifier>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            locks,
            verifier,
            config,
            trades: RwLock::new(HashMap::new()),
            leg_to_trade: RwLock::new(HashMap::new()),
        }
    }

    /// Open settlement for a matched trade.
    ///
    /// Idempotent on `trade_id`: the same legs return the existing rows.
    /// If any collateral lock fails, the locks already taken are released,
    /// every leg is stored as `failed`, and the lock error is returned.
    ///
    /// # Errors
    /// - `InvalidSettlement` for an empty or malformed leg set
    /// - `SettlementMismatch` if the trade exists with different legs
    /// - `InsufficientBalance` if an obligor cannot cover their send leg
    /// - `Configuration` if the leg lifetime overflows the clock
    pub fn request_settlement(
        &self,
        trade_id: TradeId,
        legs: Vec<SettlementLeg>,
    ) -> Result<Vec<SettlementRequest>> {
        validate_legs(trade_id, &legs)?;
        let now = Utc::now();
        let expires_at = Duration::try_seconds(self.config.ttl_secs)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                TallyError::Configuration(format!(
                    "settlement.ttl_secs {} does not give a valid deadline",
                    self.config.ttl_secs
                ))
            })?;

        let slot = Arc::clone(self.trades.write().entry(trade_id).or_default());
        let mut state = slot.lock();

        if !state.legs.is_empty() {
            let same = state.legs.len() == legs.len()
                && state.legs.iter().zip(&legs).all(|(req, leg)| describes(req, leg));
            if !same {
                return Err(TallyError::SettlementMismatch(trade_id));
            }
            debug!(trade = %trade_id, "Settlement already requested");
            return Ok(state.legs.clone());
        }

        let mut requests: Vec<SettlementRequest> = legs
            .into_iter()
            .zip(0u32..)
            .map(|(leg, idx)| SettlementRequest::pending(trade_id, idx, leg, expires_at, now))
            .collect();

        if let Err(err) = self.lock_collateral(&requests) {
            warn!(trade = %trade_id, error = %err, "Collateral lock failed; settlement rejected");
            for req in &mut requests {
                req.transition(SettlementStatus::Failed, now)?;
                req.failure_reason = Some(format!("collateral lock failed: {err}"));
            }
            state.legs = requests;
            state.finalized = true;
            self.index_legs(trade_id, &state.legs);
            return Err(err);
        }

        info!(
            trade = %trade_id,
            legs = requests.len(),
            expires_at = %expires_at,
            "Settlement requested"
        );
        state.legs = requests;
        self.index_legs(trade_id, &state.legs);
        Ok(state.legs.clone())
    }

    /// Record the on-chain transaction an obligor broadcast for a leg.
    ///
    /// # Errors
    /// - `InvalidSettlement` if `tx_hash` is not hex
    /// - `InvalidTransition` if the leg is not `pending`, or has expired
    pub fn report_submission(
        &self,
        id: SettlementRequestId,
        tx_hash: &str,
    ) -> Result<SettlementRequest> {
        let (trade_id, slot) = self.trade_of(id)?;
        let hash = normalize_tx_hash(tx_hash).ok_or_else(|| TallyError::InvalidSettlement {
            trade: trade_id,
            reason: format!("malformed tx hash {tx_hash:?}"),
        })?;

        let mut state = slot.lock();
        let now = Utc::now();
        let leg = state.leg(id)?;

        if leg.status == SettlementStatus::Submitted && leg.tx_hash.as_deref() == Some(&hash) {
            return Ok(leg.clone());
        }
        if leg.is_overdue(now) {
            self.fail_trade(&mut state, id, SettlementStatus::Expired, "deadline passed", now)?;
            return Err(TallyError::InvalidTransition {
                request: id,
                from: SettlementStatus::Expired,
                to: SettlementStatus::Submitted,
            });
        }

        let leg = state.leg_mut(id)?;
        leg.transition(SettlementStatus::Submitted, now)?;
        leg.tx_hash = Some(hash);
        info!(trade = %trade_id, leg = %id, tx = ?leg.tx_hash, "Settlement leg submitted");
        Ok(leg.clone())
    }

    /// Verify a submitted leg on-chain and confirm it.
    ///
    /// The chain is queried without holding the trade lock; the leg is
    /// re-read afterwards and the result only applied if it is unchanged.
    /// A negative verification fails the whole trade.
    ///
    /// # Errors
    /// - `InvalidTransition` if the leg is not `submitted`
    /// - `Collaborator` if the verifier cannot answer
    pub fn confirm_settlement(&self, id: SettlementRequestId) -> Result<SettlementRequest> {
        let (trade_id, slot) = self.trade_of(id)?;

        let (snapshot, hash) = {
            let state = slot.lock();
            let leg = state.leg(id)?;
            if leg.status == SettlementStatus::Confirmed {
                return Ok(leg.clone());
            }
            if leg.status != SettlementStatus::Submitted {
                return Err(TallyError::InvalidTransition {
                    request: id,
                    from: leg.status,
                    to: SettlementStatus::Confirmed,
                });
            }
            let hash = leg.tx_hash.clone().unwrap_or_default();
            (leg.clone(), hash)
        };

        let verified = self.verifier.verify_transaction(&snapshot, &hash)?;

        let mut state = slot.lock();
        let now = Utc::now();
        let leg = state.leg(id)?;
        if leg.status != SettlementStatus::Submitted || leg.tx_hash.as_deref() != Some(&hash) {
            if leg.status == SettlementStatus::Confirmed {
                return Ok(leg.clone());
            }
            return Err(TallyError::InvalidTransition {
                request: id,
                from: leg.status,
                to: SettlementStatus::Confirmed,
            });
        }

        if !verified {
            warn!(trade = %trade_id, leg = %id, tx = %hash, "On-chain verification failed");
            self.fail_trade(&mut state, id, SettlementStatus::Failed, "verification failed", now)?;
            return state.leg(id).cloned();
        }

        let completes = state
            .legs
            .iter()
            .all(|l| l.id == id || l.status == SettlementStatus::Confirmed);
        if completes && !state.finalized {
            for req in state.legs.iter().filter(|l| l.holds_collateral()) {
                self.locks.settle_outstanding(
                    req.user_id,
                    &req.asset,
                    CommitmentRef::Settlement(req.id),
                )?;
            }
            state.finalized = true;
        }

        let leg = state.leg_mut(id)?;
        leg.transition(SettlementStatus::Confirmed, now)?;
        let confirmed = leg.clone();
        info!(trade = %trade_id, leg = %id, "Settlement leg confirmed");
        if completes {
            info!(trade = %trade_id, legs = state.legs.len(), "Trade fully settled");
        }
        Ok(confirmed)
    }

    /// Explicitly fail a pending or submitted leg, and with it the trade.
    ///
    /// # Errors
    /// `InvalidTransition` if the leg is already terminal.
    pub fn reject_settlement(
        &self,
        id: SettlementRequestId,
        reason: &str,
    ) -> Result<SettlementRequest> {
        let (_, slot) = self.trade_of(id)?;
        let mut state = slot.lock();
        let now = Utc::now();
        let status = state.leg(id)?.status;
        if !status.can_transition_to(SettlementStatus::Failed) {
            return Err(TallyError::InvalidTransition {
                request: id,
                from: status,
                to: SettlementStatus::Failed,
            });
        }
        self.fail_trade(&mut state, id, SettlementStatus::Failed, reason, now)?;
        state.leg(id).cloned()
    }

    /// Expire every pending leg whose deadline is before `now`.
    ///
    /// Returns the expired leg IDs. A trade whose collateral cannot be
    /// released is logged and retried on the next sweep.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<SettlementRequestId> {
        let slots: Vec<_> = self.trades.read().values().cloned().collect();
        let mut expired = Vec::new();

        for slot in slots {
            let mut state = slot.lock();
            let overdue: Vec<_> = state
                .legs
                .iter()
                .filter(|leg| leg.is_overdue(now))
                .map(|leg| leg.id)
                .collect();
            let Some(&first) = overdue.first() else {
                continue;
            };
            match self.fail_trade(&mut state, first, SettlementStatus::Expired, "deadline passed", now) {
                Ok(()) => expired.extend(overdue),
                Err(err) => warn!(leg = %first, error = %err, "Expiry sweep could not release collateral"),
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired settlement legs");
        }
        expired
    }

    #[must_use]
    pub fn request(&self, id: SettlementRequestId) -> Option<SettlementRequest> {
        let (_, slot) = self.trade_of(id).ok()?;
        let state = slot.lock();
        state.leg(id).ok().cloned()
    }

    #[must_use]
    pub fn legs_for_trade(&self, trade_id: TradeId) -> Vec<SettlementRequest> {
        self.trades
            .read()
            .get(&trade_id)
            .map(|slot| slot.lock().legs.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn trade_status(&self, trade_id: TradeId) -> Option<TradeSettlementState> {
        let slot = self.trades.read().get(&trade_id).cloned()?;
        let state = slot.lock();
        (!state.legs.is_empty()).then(|| state.status())
    }

    fn trade_of(&self, id: SettlementRequestId) -> Result<(TradeId, Arc<Mutex<TradeState>>)> {
        let trade_id = *self
            .leg_to_trade
            .read()
            .get(&id)
            .ok_or(TallyError::SettlementNotFound(id))?;
        let slot = self
            .trades
            .read()
            .get(&trade_id)
            .cloned()
            .ok_or(TallyError::SettlementNotFound(id))?;
        Ok((trade_id, slot))
    }

    fn index_legs(&self, trade_id: TradeId, legs: &[SettlementRequest]) {
        let mut index = self.leg_to_trade.write();
        for leg in legs {
            index.insert(leg.id, trade_id);
        }
    }

    /// Lock collateral for every send leg, undoing earlier locks on failure.
    fn lock_collateral(&self, requests: &[SettlementRequest]) -> Result<()> {
        let mut taken: Vec<&SettlementRequest> = Vec::new();
        for req in requests.iter().filter(|r| r.holds_collateral()) {
            let commitment = CommitmentRef::Settlement(req.id);
            match self.locks.lock(req.user_id, &req.asset, req.amount, commitment) {
                Ok(_) => taken.push(req),
                Err(err) => {
                    for done in taken {
                        self.locks.release_outstanding(
                            done.user_id,
                            &done.asset,
                            CommitmentRef::Settlement(done.id),
                        )?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Fail the trade because of leg `cause`: release every collateral lock
    /// still open, then mark `cause` with `status`. Siblings still in flight
    /// become failed, or expired if they are pending past their deadline.
    fn fail_trade(
        &self,
        state: &mut TradeState,
        cause: SettlementRequestId,
        status: SettlementStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !state.finalized {
            for req in state.legs.iter().filter(|l| l.holds_collateral()) {
                let commitment = CommitmentRef::Settlement(req.id);
                let open = self
                    .locks
                    .lock_record(req.user_id, &req.asset, &commitment)
                    .is_some_and(|r| r.outstanding() > Decimal::ZERO);
                if open {
                    self.locks.release_outstanding(req.user_id, &req.asset, commitment)?;
                }
            }
            state.finalized = true;
        }

        let leg = state.leg_mut(cause)?;
        let trade_id = leg.trade_id;
        leg.transition(status, now)?;
        leg.failure_reason = Some(reason.to_string());

        for sibling in state.legs.iter_mut().filter(|l| l.id != cause) {
            if sibling.is_overdue(now) {
                sibling.transition(SettlementStatus::Expired, now)?;
                sibling.failure_reason = Some("deadline passed".into());
            } else if matches!(sibling.status, SettlementStatus::Pending | SettlementStatus::Submitted) {
                sibling.transition(SettlementStatus::Failed, now)?;
                sibling.failure_reason = Some(format!("counterparty leg {cause} {status}"));
            }
        }

        warn!(trade = %trade_id, leg = %cause, %status, reason, "Trade settlement failed");
        Ok(())
    }
}

fn validate_legs(trade_id: TradeId, legs: &[SettlementLeg]) -> Result<()> {
    let invalid = |reason: String| TallyError::InvalidSettlement {
        trade: trade_id,
        reason,
    };
    if legs.is_empty() {
        return Err(invalid("no legs".into()));
    }
    for (idx, leg) in legs.iter().enumerate() {
        if leg.amount <= Decimal::ZERO {
            return Err(invalid(format!("leg {idx}: amount must be positive")));
        }
        if leg.user_id == leg.counterparty_id {
            return Err(invalid(format!("leg {idx}: user settles with themselves")));
        }
        if leg.asset.trim().is_empty() || leg.destination_address.trim().is_empty() {
            return Err(invalid(format!("leg {idx}: missing asset or destination")));
        }
    }
    Ok(())
}

/// Whether a stored request was created from `leg`.
fn describes(req: &SettlementRequest, leg: &SettlementLeg) -> bool {
    req.user_id == leg.user_id
        && req.counterparty_id == leg.counterparty_id
        && req.direction == leg.direction
        && req.asset == leg.asset
        && req.amount == leg.amount
        && req.destination_address == leg.destination_address
}
