//! Dummy values for tests. **Never use in production.**

use rust_decimal::Decimal;

use crate::{
    MarketPair, OpenOrder, OrderId, OrderSide, PendingWithdrawal, SettlementDirection,
    SettlementLeg, UserId, WithdrawalId, WithdrawalStatus,
};

/// Random 32-byte transaction hash, hex encoded with a `0x` prefix.
#[must_use]
pub fn random_tx_hash() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("0x{}", hex::encode(bytes))
}

impl OpenOrder {
    /// A BTC/USDT limit order.
    #[must_use]
    pub fn dummy_limit(side: OrderSide, price: Decimal, remaining: Decimal) -> Self {
        Self {
            order_id: OrderId::new(),
            symbol: MarketPair::new("BTC", "USDT"),
            side,
            price,
            remaining_amount: remaining,
        }
    }
}

impl PendingWithdrawal {
    #[must_use]
    pub fn dummy(asset: &str, amount: Decimal) -> Self {
        Self {
            withdrawal_id: WithdrawalId::new(),
            asset: asset.to_string(),
            amount,
            status: WithdrawalStatus::Pending,
        }
    }
}

impl SettlementLeg {
    /// `user` sends `amount` of `asset` to `counterparty`.
    #[must_use]
    pub fn dummy_send(user: UserId, counterparty: UserId, asset: &str, amount: Decimal) -> Self {
        Self {
            user_id: user,
            counterparty_id: counterparty,
            direction: SettlementDirection::Send,
            asset: asset.to_string(),
            amount,
            destination_address: format!("addr:{counterparty}:{asset}"),
        }
    }
}
