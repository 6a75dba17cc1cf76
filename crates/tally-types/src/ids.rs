//! Globally unique identifiers used throughout Tally.
//!
//! Entity IDs use UUIDv7 for time-ordered lexicographic sorting, except
//! settlement legs, which are derived deterministically from their trade so
//! that a retried `request_settlement` produces the same rows.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUIDv7-backed identifier with `new`, `Default` and `Display`.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            #[must_use]
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a platform user.
    UserId,
    ""
);

uuid_id!(
    /// Identifier of a trading order owned by the order subsystem.
    OrderId,
    ""
);

uuid_id!(
    /// Identifier of a withdrawal request owned by the withdrawal subsystem.
    WithdrawalId,
    ""
);

uuid_id!(
    /// Identifier of a matched trade handed over by the matching subsystem.
    TradeId,
    ""
);

uuid_id!(
    /// Identifier of a single transaction-log entry.
    EntryId,
    "tx:"
);

// ---------------------------------------------------------------------------
// SettlementRequestId
// ---------------------------------------------------------------------------

/// Identifier of one settlement leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SettlementRequestId(pub Uuid);

impl SettlementRequestId {
    /// Deterministic leg ID from the trade and the leg's position.
    ///
    /// Re-submitting the same trade always yields the same leg IDs, which
    /// keeps the collateral lock keys (`lock:settlement:<id>`) stable.
    #[must_use]
    pub fn for_leg(trade_id: TradeId, leg_index: u32) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"tally:settlement_leg:v1:");
        hasher.update(trade_id.0.as_bytes());
        hasher.update(leg_index.to_le_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for SettlementRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type alias for asset identifiers (e.g., "BTC", "USDT", "RWD").
pub type Asset = String;

// ---------------------------------------------------------------------------
// MarketPair
// ---------------------------------------------------------------------------

/// A trading pair (e.g., BTC/USDT).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MarketPair {
    pub base: String,
    pub quote: String,
}

impl MarketPair {
    #[must_use]
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Parse `"BASE/QUOTE"`; returns `None` for anything else.
    #[must_use]
    pub fn parse(symbol: &str) -> Option<Self> {
        let (base, quote) = symbol.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }

    #[must_use]
    pub fn involves(&self, asset: &str) -> bool {
        self.base == asset || self.quote == asset
    }
}

impl fmt::Display for MarketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_uniqueness_and_ordering() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn entry_id_display_prefix() {
        let id = EntryId::new();
        assert!(id.to_string().starts_with("tx:"));
    }

    #[test]
    fn settlement_leg_id_deterministic() {
        let trade = TradeId::new();
        let a = SettlementRequestId::for_leg(trade, 0);
        let b = SettlementRequestId::for_leg(trade, 0);
        assert_eq!(a, b);
        assert_ne!(a, SettlementRequestId::for_leg(trade, 1));
        assert_ne!(a, SettlementRequestId::for_leg(TradeId::new(), 0));
    }

    #[test]
    fn market_pair_parse() {
        let pair = MarketPair::parse("BTC/USDT").unwrap();
        assert_eq!(pair, MarketPair::new("BTC", "USDT"));
        assert_eq!(pair.to_string(), "BTC/USDT");
        assert!(pair.involves("USDT"));
        assert!(!pair.involves("ETH"));
        assert!(MarketPair::parse("BTCUSDT").is_none());
        assert!(MarketPair::parse("/USDT").is_none());
    }

    #[test]
    fn serde_roundtrips() {
        let uid = UserId::new();
        let json = serde_json::to_string(&uid).unwrap();
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, back);
    }
}
