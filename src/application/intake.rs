//! Order intake: validation, dispatch, and cancellation.
//!
//! Conditionals become PENDING ledger rows mirrored into the order cache;
//! market orders go straight onto the durable trade queue. Validation runs
//! against lock-free snapshots; settlement re-checks everything under locks,
//! so intake only has to keep obviously unfundable orders out.

use crate::domain::errors::EngineError;
use crate::domain::events::{TradeEvent, CHANNEL_TRADE_EVENTS};
use crate::domain::matching::initial_trailing_stop;
use crate::domain::order::{Order, OrderRequest, TradeInstruction};
use crate::domain::types::{OrderSide, OrderStatus, OrderType};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::order_cache::OrderBookCache;
use crate::infrastructure::persistence::ledger::Ledger;
use crate::infrastructure::price_store::PriceStore;
use crate::infrastructure::trade_queue::DurableQueue;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

/// What the caller gets back for a submission or cancel.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub message: String,
}

/// Request fields resolved during validation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ValidatedPrices {
    stop_price: Option<Decimal>,
    high_water_mark: Option<Decimal>,
}

/// Pre-trade validation over snapshots: bounds, required prices, and the
/// funds/shares check. Returns trailing-stop seeds where applicable.
fn validate_request(
    req: &OrderRequest,
    available_qty: Decimal,
    balance: Decimal,
    fee_rate: Decimal,
    current_price: Option<Decimal>,
) -> Result<ValidatedPrices, EngineError> {
    if req.quantity <= Decimal::ZERO {
        return Err(EngineError::validation("quantity must be positive"));
    }

    let positive = |price: Option<Decimal>| price.filter(|p| *p > Decimal::ZERO);
    let tape = || {
        current_price.ok_or_else(|| EngineError::MarketPriceNotFound {
            ticker_id: req.ticker_id.clone(),
        })
    };

    // Type-specific bounds, yielding the reference price for the funds
    // check: the limit price for LIMIT, the stop for the stop family, the
    // tape for MARKET/TRAILING.
    let mut trailing_seed = None;
    let reference_price = match req.order_type {
        OrderType::Limit => positive(req.target_price).ok_or_else(|| {
            EngineError::validation("limit orders require a positive target price")
        })?,
        OrderType::StopLimit => {
            positive(req.target_price).ok_or_else(|| {
                EngineError::validation("stop-limit orders require a positive target price")
            })?;
            positive(req.stop_price).ok_or_else(|| {
                EngineError::validation("stop-limit orders require a positive stop price")
            })?
        }
        OrderType::StopLoss | OrderType::TakeProfit => {
            positive(req.stop_price).ok_or_else(|| {
                EngineError::validation(format!(
                    "{} orders require a positive stop price",
                    req.order_type
                ))
            })?
        }
        OrderType::TrailingStop => {
            let gap = positive(req.trailing_gap).ok_or_else(|| {
                EngineError::validation("trailing-stop orders require a positive trailing gap")
            })?;
            let current = tape()?;
            trailing_seed = Some(ValidatedPrices {
                stop_price: Some(initial_trailing_stop(req.side, current, gap)),
                high_water_mark: Some(current),
            });
            current
        }
        OrderType::Market => tape()?,
    };

    match req.side {
        OrderSide::Sell => {
            if available_qty > Decimal::ZERO {
                // Closing a long: must actually hold the shares.
                if available_qty < req.quantity {
                    return Err(EngineError::InsufficientShares {
                        owned: available_qty,
                        requested: req.quantity,
                    });
                }
            } else {
                // Opening or extending a short: margin at the reference
                // price, no fee loaded since the proceeds cover it.
                let required_margin = reference_price * req.quantity;
                if balance < required_margin {
                    return Err(EngineError::InsufficientBalance {
                        required: required_margin,
                        available: balance,
                    });
                }
            }
        }
        OrderSide::Buy => {
            let required = reference_price * req.quantity * (Decimal::ONE + fee_rate);
            if balance < required {
                return Err(EngineError::InsufficientBalance {
                    required,
                    available: balance,
                });
            }
        }
    }

    Ok(trailing_seed.unwrap_or(ValidatedPrices {
        stop_price: req.stop_price,
        high_water_mark: None,
    }))
}

pub struct IntakeService {
    ledger: Ledger,
    prices: PriceStore,
    cache: OrderBookCache,
    trade_queue: DurableQueue,
    bus: EventBus,
}

impl IntakeService {
    pub fn new(
        ledger: Ledger,
        prices: PriceStore,
        cache: OrderBookCache,
        trade_queue: DurableQueue,
        bus: EventBus,
    ) -> Self {
        Self {
            ledger,
            prices,
            cache,
            trade_queue,
            bus,
        }
    }

    pub async fn submit_order(
        &self,
        user_id: Uuid,
        req: OrderRequest,
    ) -> Result<OrderTicket, EngineError> {
        // Snapshot portfolio and wallet; no locks at intake.
        let available_qty = self
            .ledger
            .position_of(user_id, &req.ticker_id)
            .await?
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let balance = self
            .ledger
            .wallet_of(user_id)
            .await?
            .map(|w| w.balance)
            .unwrap_or(Decimal::ZERO);
        let fee_rate = self.prices.trading_fee_rate().await?;

        let needs_current = matches!(req.order_type, OrderType::Market | OrderType::TrailingStop);
        let current_price = if needs_current {
            self.prices.current_price(&req.ticker_id).await?
        } else {
            None
        };

        let validated = validate_request(&req, available_qty, balance, fee_rate, current_price)?;

        let order_id = Uuid::new_v4();

        if req.order_type.is_conditional() {
            let mut order = Order::pending(order_id, user_id, &req);
            order.stop_price = validated.stop_price;
            order.high_water_mark = validated.high_water_mark;

            let mut tx = self.ledger.begin().await?;
            tx.insert_order(&order).await?;
            tx.commit().await?;

            self.cache.add_order(&order).await?;
            if let Err(e) = self
                .bus
                .publish(
                    CHANNEL_TRADE_EVENTS,
                    &TradeEvent::OrderCreated {
                        user_id,
                        order_id,
                        ticker_id: req.ticker_id.clone(),
                    },
                )
                .await
            {
                warn!(order_id = %order_id, error = %e, "order_created event not published");
            }

            info!(
                order_id = %order_id,
                ticker_id = %req.ticker_id,
                order_type = %req.order_type,
                side = %req.side,
                "Conditional order resting"
            );

            let message = match req.order_type {
                OrderType::Limit => format!(
                    "Limit order placed at {}",
                    req.target_price.unwrap_or_default()
                ),
                OrderType::StopLimit => format!(
                    "Stop-limit order placed (trigger {}, limit {})",
                    req.stop_price.unwrap_or_default(),
                    req.target_price.unwrap_or_default()
                ),
                OrderType::TrailingStop => format!(
                    "Trailing stop placed (gap {}, initial stop {})",
                    req.trailing_gap.unwrap_or_default(),
                    validated.stop_price.unwrap_or_default()
                ),
                other => format!(
                    "{other} order placed at {}",
                    validated.stop_price.unwrap_or_default()
                ),
            };

            return Ok(OrderTicket {
                order_id,
                status: OrderStatus::Pending,
                message,
            });
        }

        // Market order: enqueue only. Nothing is persisted until a worker
        // picks it up, so a queue failure leaves no trace.
        let instruction = TradeInstruction {
            order_id,
            user_id,
            ticker_id: req.ticker_id.clone(),
            side: req.side,
            quantity: req.quantity,
        };
        let fresh = self
            .trade_queue
            .publish(&instruction, req.idempotency_key.as_deref())
            .await?;

        let message = if fresh {
            "Order has been queued for processing.".to_string()
        } else {
            "Duplicate submission ignored; original order stands.".to_string()
        };

        Ok(OrderTicket {
            order_id,
            status: OrderStatus::Accepted,
            message,
        })
    }

    /// Cancels a PENDING order. The order-row lock arbitrates races with the
    /// matcher: whichever side commits first wins, the loser sees the
    /// changed status and walks away.
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderTicket, EngineError> {
        let mut tx = self.ledger.begin().await?;

        let order = tx
            .lock_order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound)?;
        order.ensure_cancellable_by(user_id)?;

        tx.mark_order_cancelled(&order, "Cancelled by user").await?;
        tx.commit().await?;

        self.cache.remove_order(order_id, &order.ticker_id).await?;
        if let Err(e) = self
            .bus
            .publish(
                CHANNEL_TRADE_EVENTS,
                &TradeEvent::OrderCancelled {
                    user_id,
                    order_id,
                    ticker_id: order.ticker_id.clone(),
                },
            )
            .await
        {
            warn!(order_id = %order_id, error = %e, "order_cancelled event not published");
        }

        info!(order_id = %order_id, "Order cancelled");

        Ok(OrderTicket {
            order_id,
            status: OrderStatus::Cancelled,
            message: "Order has been cancelled.".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: OrderSide, order_type: OrderType, qty: Decimal) -> OrderRequest {
        OrderRequest {
            ticker_id: "CRYPTO-BTC".to_string(),
            side,
            order_type,
            quantity: qty,
            target_price: None,
            stop_price: None,
            trailing_gap: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_rejects_non_positive_quantity() {
        let req = request(OrderSide::Buy, OrderType::Market, dec!(0));
        let err =
            validate_request(&req, dec!(0), dec!(1000), dec!(0.001), Some(dec!(100))).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_limit_requires_target_price() {
        let mut req = request(OrderSide::Buy, OrderType::Limit, dec!(1));
        assert!(matches!(
            validate_request(&req, dec!(0), dec!(1000), dec!(0.001), None),
            Err(EngineError::Validation { .. })
        ));

        req.target_price = Some(dec!(-5));
        assert!(matches!(
            validate_request(&req, dec!(0), dec!(1000), dec!(0.001), None),
            Err(EngineError::Validation { .. })
        ));

        req.target_price = Some(dec!(100));
        assert!(validate_request(&req, dec!(0), dec!(1000), dec!(0.001), None).is_ok());
    }

    #[test]
    fn test_market_requires_tape() {
        let req = request(OrderSide::Buy, OrderType::Market, dec!(1));
        assert!(matches!(
            validate_request(&req, dec!(0), dec!(1000), dec!(0.001), None),
            Err(EngineError::MarketPriceNotFound { .. })
        ));
    }

    #[test]
    fn test_buy_funds_check_loads_fee() {
        // 10 * 100 * 1.001 = 1001 required.
        let req = request(OrderSide::Buy, OrderType::Market, dec!(10));
        let err = validate_request(&req, dec!(0), dec!(1000.99), dec!(0.001), Some(dec!(100)))
            .unwrap_err();
        match err {
            EngineError::InsufficientBalance {
                required,
                available,
            } => {
                assert_eq!(required, dec!(1001.00));
                assert_eq!(available, dec!(1000.99));
            }
            other => panic!("unexpected: {other}"),
        }

        assert!(
            validate_request(&req, dec!(0), dec!(1001), dec!(0.001), Some(dec!(100))).is_ok()
        );
    }

    #[test]
    fn test_sell_long_requires_shares() {
        let req = request(OrderSide::Sell, OrderType::Market, dec!(5));
        let err =
            validate_request(&req, dec!(3), dec!(0), dec!(0.001), Some(dec!(100))).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientShares { .. }));
    }

    #[test]
    fn test_short_margin_unloaded_with_fee() {
        // Flat position: selling opens a short; margin is price * qty.
        let req = request(OrderSide::Sell, OrderType::Market, dec!(5));
        assert!(
            validate_request(&req, dec!(0), dec!(500), dec!(0.001), Some(dec!(100))).is_ok()
        );
        assert!(matches!(
            validate_request(&req, dec!(0), dec!(499.99), dec!(0.001), Some(dec!(100))),
            Err(EngineError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_short_margin_uses_stop_price_for_stop_family() {
        let mut req = request(OrderSide::Sell, OrderType::StopLoss, dec!(2));
        req.stop_price = Some(dec!(90));
        // margin 180; no tape needed.
        assert!(validate_request(&req, dec!(0), dec!(180), dec!(0.001), None).is_ok());
        assert!(validate_request(&req, dec!(0), dec!(179), dec!(0.001), None).is_err());
    }

    #[test]
    fn test_trailing_stop_seeds() {
        let mut req = request(OrderSide::Sell, OrderType::TrailingStop, dec!(1));
        req.trailing_gap = Some(dec!(5));

        let validated =
            validate_request(&req, dec!(1), dec!(0), dec!(0.001), Some(dec!(100))).unwrap();
        assert_eq!(validated.stop_price, Some(dec!(95)));
        assert_eq!(validated.high_water_mark, Some(dec!(100)));

        req.side = OrderSide::Buy;
        let validated =
            validate_request(&req, dec!(0), dec!(1000), dec!(0.001), Some(dec!(100))).unwrap();
        assert_eq!(validated.stop_price, Some(dec!(105)));
    }

    #[test]
    fn test_trailing_stop_requires_gap() {
        let req = request(OrderSide::Sell, OrderType::TrailingStop, dec!(1));
        assert!(matches!(
            validate_request(&req, dec!(1), dec!(0), dec!(0.001), Some(dec!(100))),
            Err(EngineError::Validation { .. })
        ));
    }
}
