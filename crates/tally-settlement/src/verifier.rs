//! On-chain verification seam.
//!
//! Broadcasting and chain access live outside the core; the coordinator
//! only asks whether a reported transaction really paid a leg.

use tally_types::{Result, SettlementRequest};

/// Answers whether a reported transaction fulfils a settlement leg.
pub trait ChainVerifier: Send + Sync {
    /// `Ok(false)` means the chain says no: wrong amount, wrong destination,
    /// reverted or unknown. `Err` means the chain could not be asked; the
    /// leg stays `submitted` so confirmation can be retried.
    fn verify_transaction(&self, request: &SettlementRequest, tx_hash: &str) -> Result<bool>;
}

/// Lower-case a transaction hash and make sure it is hex.
///
/// Returns `None` for anything that is not a non-empty hex string with an
/// optional `0x` prefix.
#[must_use]
pub fn normalize_tx_hash(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    let bytes = hex::decode(digits).ok()?;
    Some(format!("0x{}", hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_prefixed_and_bare_hex() {
        assert_eq!(normalize_tx_hash("0xABcd").as_deref(), Some("0xabcd"));
        assert_eq!(normalize_tx_hash("abcd").as_deref(), Some("0xabcd"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_tx_hash("").is_none());
        assert!(normalize_tx_hash("0x").is_none());
        assert!(normalize_tx_hash("0xzz").is_none());
        // Odd length is not a whole number of bytes.
        assert!(normalize_tx_hash("abc").is_none());
    }

    #[test]
    fn random_hash_round_trips() {
        let hash = tally_types::fixtures::random_tx_hash();
        assert_eq!(normalize_tx_hash(&hash), Some(hash));
    }
}
