//! System-wide constants for the Tally ledger.

use rust_decimal::Decimal;

/// Default reward-token asset code.
pub const DEFAULT_REWARD_ASSET: &str = "RWD";

/// Locked balances at or below this amount are ignored by the reconciler.
/// Expressed as `(mantissa, scale)` = 0.00000001.
pub const DEFAULT_RECONCILE_EPSILON: (i64, u32) = (1, 8);

/// Default reconciliation polling interval in seconds.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;

/// How often a corrective write is retried after an optimistic-recheck
/// conflict before the row is skipped for this pass.
pub const DEFAULT_RECONCILE_CONFLICT_RETRIES: u32 = 3;

/// Default lifetime of a settlement leg before it can expire.
pub const DEFAULT_SETTLEMENT_TTL_SECS: i64 = 3600;

/// Longest accepted settlement leg lifetime (30 days).
pub const MAX_SETTLEMENT_TTL_SECS: i64 = 30 * 24 * 3600;

/// Hard cap on referral depth regardless of configuration.
pub const MAX_COMMISSION_DEPTH: usize = 10;

/// Extra ancestors a roll-up cascade may inspect beyond its level count.
pub const DEFAULT_ROLL_UP_EXTRA_HOPS: usize = 5;

/// Maximum ancestors inspected when checking a new link for cycles.
pub const MAX_SPONSOR_CHAIN_SCAN: usize = 1024;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Tally";

/// Default epsilon as a `Decimal`.
#[must_use]
pub fn default_reconcile_epsilon() -> Decimal {
    let (mantissa, scale) = DEFAULT_RECONCILE_EPSILON;
    Decimal::new(mantissa, scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_identity_matches_package() {
        assert_eq!(ENGINE_NAME, "Tally");
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
        assert!(VERSION.split('.').count() >= 3);
    }

    #[test]
    fn default_ttl_within_cap() {
        assert!(DEFAULT_SETTLEMENT_TTL_SECS <= MAX_SETTLEMENT_TTL_SECS);
        assert!(chrono::Duration::try_seconds(MAX_SETTLEMENT_TTL_SECS).is_some());
    }
}
