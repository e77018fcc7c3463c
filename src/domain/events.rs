use crate::domain::types::{OrderSide, OrderStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Bus channel names
pub const CHANNEL_PRICE_UPDATES: &str = "price_updates";
pub const CHANNEL_TRADE_EVENTS: &str = "trade_events";
pub const CHANNEL_HUMAN_EVENTS: &str = "human_events";
pub const CHANNEL_LIQUIDATION_EVENTS: &str = "liquidation_events";

// Durable queue names
pub const TRADE_QUEUE: &str = "trade_queue";
pub const AUDIT_QUEUE: &str = "audit_queue";

/// Tick published on `price_updates` whenever a ticker's price moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub ticker_id: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Order lifecycle events on `trade_events`. The matcher consumes these to
/// keep the conditional cache coherent without sweeping the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TradeEvent {
    #[serde(rename = "order_created")]
    OrderCreated {
        user_id: Uuid,
        order_id: Uuid,
        ticker_id: String,
    },
    #[serde(rename = "order_cancelled")]
    OrderCancelled {
        user_id: Uuid,
        order_id: Uuid,
        ticker_id: String,
    },
    #[serde(rename = "trade_executed")]
    TradeExecuted {
        user_id: Uuid,
        order_id: Uuid,
        ticker_id: String,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        realized_pnl: Option<Decimal>,
        status: OrderStatus,
    },
}

impl TradeEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            TradeEvent::OrderCreated { order_id, .. }
            | TradeEvent::OrderCancelled { order_id, .. }
            | TradeEvent::TradeExecuted { order_id, .. } => *order_id,
        }
    }

    pub fn ticker_id(&self) -> &str {
        match self {
            TradeEvent::OrderCreated { ticker_id, .. }
            | TradeEvent::OrderCancelled { ticker_id, .. }
            | TradeEvent::TradeExecuted { ticker_id, .. } => ticker_id,
        }
    }
}

/// Events on `human_events` the engine emits as part of settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HumanEvent {
    #[serde(rename = "dividend_paid")]
    DividendPaid {
        payer_id: Uuid,
        ticker_id: String,
        total_dividend: Decimal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub user_id: Uuid,
    pub ticker_id: String,
    pub equity: Decimal,
    pub liability: Decimal,
}

/// Append-only audit record staged in the transactional outbox and persisted
/// by the audit sink. Producers pass pre/post images explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum AuditEvent {
    #[serde(rename = "wallet_tx")]
    WalletTx {
        user_id: Uuid,
        wallet_id: Uuid,
        prev_balance: Decimal,
        new_balance: Decimal,
        reason: String,
    },
    #[serde(rename = "portfolio_history")]
    PortfolioHistory {
        user_id: Uuid,
        ticker_id: String,
        action: PortfolioAction,
        prev_quantity: Option<Decimal>,
        new_quantity: Option<Decimal>,
        prev_average_price: Option<Decimal>,
        new_average_price: Option<Decimal>,
        reason: String,
    },
    #[serde(rename = "order_status_history")]
    OrderStatus {
        order_id: Uuid,
        user_id: Uuid,
        prev_status: Option<OrderStatus>,
        new_status: OrderStatus,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortfolioAction {
    Insert,
    Update,
    Delete,
}

impl PortfolioAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortfolioAction::Insert => "insert",
            PortfolioAction::Update => "update",
            PortfolioAction::Delete => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_event_json_tagging() {
        let event = TradeEvent::TradeExecuted {
            user_id: Uuid::nil(),
            order_id: Uuid::nil(),
            ticker_id: "HUMAN-x".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(1),
            price: dec!(100),
            fee: dec!(0.1),
            realized_pnl: None,
            status: OrderStatus::Filled,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "trade_executed");
        assert_eq!(json["side"], "BUY");
        assert_eq!(json["status"], "FILLED");

        let back: TradeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.ticker_id(), "HUMAN-x");
    }

    #[test]
    fn test_audit_event_envelope() {
        let event = AuditEvent::PortfolioHistory {
            user_id: Uuid::nil(),
            ticker_id: "CRYPTO-BTC".to_string(),
            action: PortfolioAction::Delete,
            prev_quantity: Some(dec!(10)),
            new_quantity: None,
            prev_average_price: Some(dec!(100.1)),
            new_average_price: None,
            reason: "trade:sell".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "portfolio_history");
        assert_eq!(json["data"]["action"], "delete");
    }
}
