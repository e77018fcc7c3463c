use crate::domain::types::{Currency, MarketType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform user. Only the fields settlement cares about are modeled here;
/// authentication and profile data live with the API collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub is_active: bool,
    pub is_bankrupt: bool,
    pub bankruptcy_count: i32,
    /// Fraction of realized profit withheld for Human-ETF shareholders, 0..1.
    pub dividend_rate: Decimal,
}

impl User {
    /// Ticker id of this user's Human-ETF instrument.
    pub fn human_ticker_id(&self) -> String {
        format!("HUMAN-{}", self.id)
    }
}

/// One cash wallet per user. Every balance write must carry a reason tag and
/// produce exactly one wallet_transaction_history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Decimal,
}

/// Signed position in one ticker. quantity > 0 is long (average_price is the
/// acquisition cost per unit), quantity < 0 is short (average_price is the
/// short-entry credit per unit). Rows at dust magnitude are deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: Uuid,
    pub ticker_id: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
}

impl Position {
    pub fn empty(user_id: Uuid, ticker_id: impl Into<String>) -> Self {
        Self {
            user_id,
            ticker_id: ticker_id.into(),
            quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub market_type: MarketType,
    pub currency: Currency,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_sign_helpers() {
        let mut p = Position::empty(Uuid::new_v4(), "CRYPTO-BTC");
        assert!(!p.is_long());
        assert!(!p.is_short());

        p.quantity = dec!(3);
        assert!(p.is_long());

        p.quantity = dec!(-3);
        assert!(p.is_short());
    }

    #[test]
    fn test_human_ticker_id() {
        let user = User {
            id: Uuid::nil(),
            is_active: true,
            is_bankrupt: false,
            bankruptcy_count: 0,
            dividend_rate: dec!(0),
        };
        assert_eq!(
            user.human_ticker_id(),
            "HUMAN-00000000-0000-0000-0000-000000000000"
        );
    }
}
