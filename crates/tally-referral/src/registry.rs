//! Referral registry: the user → sponsor table.
//!
//! A sponsor link is written once and never changes except through an
//! audited admin override. Links that would make the chain loop back onto
//! the user (including self-referral) are rejected.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tally_types::constants::MAX_SPONSOR_CHAIN_SCAN;
use tally_types::{ReferralLink, Result, SponsorOverride, TallyError, UserId};
use tracing::{info, warn};

/// Resolves a user's locked sponsor.
pub trait SponsorDirectory: Send + Sync {
    fn sponsor_of(&self, user_id: UserId) -> Option<UserId>;
}

#[derive(Default)]
pub struct ReferralRegistry {
    links: RwLock<HashMap<UserId, ReferralLink>>,
    overrides: Mutex<Vec<SponsorOverride>>,
}

impl ReferralRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `sponsor_id` as the sponsor of `user_id`. First writer wins;
    /// repeating the same assignment is a no-op.
    ///
    /// # Errors
    /// - `SponsorAlreadyLocked` if a different sponsor is already set
    /// - `ReferralCycle` for self-referral or a looping chain
    pub fn assign_sponsor(&self, user_id: UserId, sponsor_id: UserId) -> Result<ReferralLink> {
        let mut links = self.links.write();

        if let Some(existing) = links.get(&user_id) {
            if existing.sponsor_id == sponsor_id {
                return Ok(existing.clone());
            }
            return Err(TallyError::SponsorAlreadyLocked {
                user: user_id,
                existing: existing.sponsor_id,
            });
        }

        ensure_acyclic(&links, user_id, sponsor_id)?;
        let link = ReferralLink {
            user_id,
            sponsor_id,
            linked_at: Utc::now(),
        };
        links.insert(user_id, link.clone());
        info!(user = %user_id, sponsor = %sponsor_id, "Sponsor locked");
        Ok(link)
    }

    /// Replace a user's sponsor. Recorded in the override trail.
    ///
    /// # Errors
    /// `ReferralCycle` for self-referral or a looping chain.
    pub fn admin_override(
        &self,
        user_id: UserId,
        new_sponsor: UserId,
        operator: &str,
        reason: &str,
    ) -> Result<SponsorOverride> {
        let mut links = self.links.write();
        ensure_acyclic(&links, user_id, new_sponsor)?;

        let now = Utc::now();
        let previous = links
            .insert(
                user_id,
                ReferralLink {
                    user_id,
                    sponsor_id: new_sponsor,
                    linked_at: now,
                },
            )
            .map(|old| old.sponsor_id);

        let record = SponsorOverride {
            user_id,
            previous_sponsor: previous,
            new_sponsor,
            operator: operator.to_string(),
            reason: reason.to_string(),
            overridden_at: now,
        };
        self.overrides.lock().push(record.clone());
        warn!(
            user = %user_id,
            previous = ?previous,
            sponsor = %new_sponsor,
            operator,
            reason,
            "Sponsor overridden by admin"
        );
        Ok(record)
    }

    #[must_use]
    pub fn link(&self, user_id: UserId) -> Option<ReferralLink> {
        self.links.read().get(&user_id).cloned()
    }

    /// Override history for one user, oldest first.
    #[must_use]
    pub fn overrides_for(&self, user_id: UserId) -> Vec<SponsorOverride> {
        self.overrides
            .lock()
            .iter()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Up to `depth` ancestors of `user_id`, direct sponsor first.
    #[must_use]
    pub fn ancestors(&self, user_id: UserId, depth: usize) -> Vec<UserId> {
        let links = self.links.read();
        let mut chain = Vec::new();
        let mut current = user_id;
        while chain.len() < depth {
            let Some(link) = links.get(&current) else { break };
            chain.push(link.sponsor_id);
            current = link.sponsor_id;
        }
        chain
    }
}

impl SponsorDirectory for ReferralRegistry {
    fn sponsor_of(&self, user_id: UserId) -> Option<UserId> {
        self.links.read().get(&user_id).map(|l| l.sponsor_id)
    }
}

/// Reject `user → sponsor` if `user` already appears above `sponsor`.
fn ensure_acyclic(
    links: &HashMap<UserId, ReferralLink>,
    user_id: UserId,
    sponsor_id: UserId,
) -> Result<()> {
    let cycle = TallyError::ReferralCycle {
        user: user_id,
        sponsor: sponsor_id,
    };
    let mut current = sponsor_id;
    for _ in 0..MAX_SPONSOR_CHAIN_SCAN {
        if current == user_id {
            return Err(cycle);
        }
        match links.get(&current) {
            Some(link) => current = link.sponsor_id,
            None => return Ok(()),
        }
    }
    // Deeper than any chain we accept.
    Err(cycle)
}
