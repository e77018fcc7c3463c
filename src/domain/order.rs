use crate::domain::errors::EngineError;
use crate::domain::types::{OrderSide, OrderStatus, OrderType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields a client supplies when submitting an order. Type-specific price
/// fields are optional here and validated by the intake service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub ticker_id: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub target_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trailing_gap: Option<Decimal>,
    /// Optional client idempotency key; dedupes at the queue boundary for 24h.
    pub idempotency_key: Option<String>,
}

/// Full order row as persisted by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ticker_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub unfilled_quantity: Decimal,
    pub target_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trailing_gap: Option<Decimal>,
    pub high_water_mark: Option<Decimal>,
    /// Execution price, set on fill.
    pub price: Option<Decimal>,
    pub fee: Decimal,
    pub realized_pnl: Option<Decimal>,
    /// Carried for reporting; conversion is never applied to settlement.
    pub applied_exchange_rate: Decimal,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Fresh PENDING conditional order from a validated request.
    pub fn pending(id: Uuid, user_id: Uuid, req: &OrderRequest) -> Self {
        Self {
            id,
            user_id,
            ticker_id: req.ticker_id.clone(),
            side: req.side,
            order_type: req.order_type,
            status: OrderStatus::Pending,
            quantity: req.quantity,
            unfilled_quantity: req.quantity,
            target_price: req.target_price,
            stop_price: req.stop_price,
            trailing_gap: req.trailing_gap,
            high_water_mark: None,
            price: None,
            fee: Decimal::ZERO,
            realized_pnl: None,
            applied_exchange_rate: Decimal::ONE,
            fail_reason: None,
            created_at: Utc::now(),
            filled_at: None,
            cancelled_at: None,
        }
    }

    /// Price used for pre-trade funds checks and cache scoring: the limit
    /// price for LIMIT/STOP_LIMIT, the stop price for the stop family.
    pub fn reference_price(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Limit | OrderType::StopLimit => self.target_price,
            OrderType::StopLoss | OrderType::TakeProfit | OrderType::TrailingStop => self.stop_price,
            OrderType::Market => None,
        }
    }

    /// Score under which the order is indexed in the conditional cache.
    pub fn cache_score(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Limit => self.target_price,
            t if t.is_stop_family() => self.stop_price,
            _ => None,
        }
    }

    pub fn ensure_cancellable_by(&self, user_id: Uuid) -> Result<(), EngineError> {
        if self.user_id != user_id {
            return Err(EngineError::PermissionDenied);
        }
        if self.status != OrderStatus::Pending {
            return Err(EngineError::NotCancellable {
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Message carried on the durable trade queue for market execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInstruction {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub ticker_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(order_type: OrderType) -> OrderRequest {
        OrderRequest {
            ticker_id: "CRYPTO-BTC".to_string(),
            side: OrderSide::Sell,
            order_type,
            quantity: dec!(2),
            target_price: Some(dec!(101)),
            stop_price: Some(dec!(99)),
            trailing_gap: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_reference_price_by_type() {
        let user = Uuid::new_v4();
        let limit = Order::pending(Uuid::new_v4(), user, &request(OrderType::Limit));
        assert_eq!(limit.reference_price(), Some(dec!(101)));

        let stop = Order::pending(Uuid::new_v4(), user, &request(OrderType::StopLoss));
        assert_eq!(stop.reference_price(), Some(dec!(99)));

        let stop_limit = Order::pending(Uuid::new_v4(), user, &request(OrderType::StopLimit));
        assert_eq!(stop_limit.reference_price(), Some(dec!(101)));
        assert_eq!(stop_limit.cache_score(), Some(dec!(99)));
    }

    #[test]
    fn test_cancellable_checks() {
        let owner = Uuid::new_v4();
        let mut order = Order::pending(Uuid::new_v4(), owner, &request(OrderType::Limit));

        assert!(order.ensure_cancellable_by(owner).is_ok());
        assert!(matches!(
            order.ensure_cancellable_by(Uuid::new_v4()),
            Err(EngineError::PermissionDenied)
        ));

        order.status = OrderStatus::Filled;
        assert!(matches!(
            order.ensure_cancellable_by(owner),
            Err(EngineError::NotCancellable { .. })
        ));
    }
}
