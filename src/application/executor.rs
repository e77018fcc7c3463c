//! Market-order execution and P2P settlement against the ledger.
//!
//! `execute_trade` is the atomic unit: one transaction holding the wallet,
//! portfolio, and order row locks, with the audit trail staged alongside.
//! Failures never propagate state: the transaction rolls back and the order
//! is marked FAILED on its own, with no `trade_executed` event.

use crate::application::dividend::DividendService;
use crate::domain::errors::EngineError;
use crate::domain::events::{
    HumanEvent, TradeEvent, CHANNEL_HUMAN_EVENTS, CHANNEL_TRADE_EVENTS,
};
use crate::domain::matching::MatchPlan;
use crate::domain::order::{Order, TradeInstruction};
use crate::domain::settlement::{settle, Settlement, SettlementInput};
use crate::domain::types::{MarketType, OrderSide, OrderStatus, OrderType};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::ledger::{Ledger, LedgerTx};
use crate::infrastructure::price_store::{vwap_fill_price, PriceStore};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Order settled and filled.
    Filled,
    /// Human-ETF order parked as PENDING for the P2P matcher.
    Handoff,
    /// Business rejection; the order row carries the reason.
    Rejected,
}

enum Publish {
    Trade(TradeEvent),
    Human(HumanEvent),
}

pub struct TradeExecutor {
    ledger: Ledger,
    prices: PriceStore,
    bus: EventBus,
}

impl TradeExecutor {
    pub fn new(ledger: Ledger, prices: PriceStore, bus: EventBus) -> Self {
        Self {
            ledger,
            prices,
            bus,
        }
    }

    /// Executes one market instruction. `price_hint` lets the conditional
    /// matcher treat its triggering tick as the fill price; a deep enough
    /// book snapshot still takes precedence via VWAP.
    pub async fn execute_trade(
        &self,
        instruction: &TradeInstruction,
        price_hint: Option<Decimal>,
    ) -> Result<ExecutionOutcome, EngineError> {
        match self.try_execute(instruction, price_hint).await {
            Ok((outcome, events)) => {
                self.publish_all(events).await;
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    order_id = %instruction.order_id,
                    error = %e,
                    "Trade execution failed; marking order FAILED"
                );
                self.mark_failed_detached(instruction.order_id, &e.user_message())
                    .await;
                if e.is_system() {
                    Err(e)
                } else {
                    Ok(ExecutionOutcome::Rejected)
                }
            }
        }
    }

    async fn try_execute(
        &self,
        instruction: &TradeInstruction,
        price_hint: Option<Decimal>,
    ) -> Result<(ExecutionOutcome, Vec<Publish>), EngineError> {
        if instruction.quantity <= Decimal::ZERO {
            return Err(EngineError::validation("quantity must be positive"));
        }

        let mut tx = self.ledger.begin().await?;

        let ticker = tx.ticker(&instruction.ticker_id).await?.ok_or_else(|| {
            EngineError::TickerNotFound {
                ticker_id: instruction.ticker_id.clone(),
            }
        })?;

        // Human-ETF instruments never fill against the tape: park the order
        // for the P2P matcher and let it cross naturally.
        if ticker.market_type == MarketType::Human {
            tx.upsert_human_order(
                instruction.order_id,
                instruction.user_id,
                &instruction.ticker_id,
                instruction.side,
                instruction.quantity,
            )
            .await?;
            tx.commit().await?;

            info!(
                order_id = %instruction.order_id,
                ticker_id = %instruction.ticker_id,
                "Human-ETF order queued for P2P matching"
            );
            return Ok((
                ExecutionOutcome::Handoff,
                vec![Publish::Trade(TradeEvent::OrderCreated {
                    user_id: instruction.user_id,
                    order_id: instruction.order_id,
                    ticker_id: instruction.ticker_id.clone(),
                })],
            ));
        }

        let price = self
            .resolve_price(instruction, price_hint)
            .await?
            .ok_or_else(|| EngineError::MarketPriceNotFound {
                ticker_id: instruction.ticker_id.clone(),
            })?;
        let fee_rate = self.prices.trading_fee_rate().await?;

        // Lock order: wallet, then portfolio, then the order row.
        let wallet = tx
            .lock_wallet(instruction.user_id)
            .await?
            .ok_or(EngineError::WalletNotFound)?;
        let (position, row_exists) = tx
            .lock_position(instruction.user_id, &instruction.ticker_id)
            .await?;

        let order = match tx.lock_order(instruction.order_id).await? {
            Some(order) => {
                if order.status.is_terminal() {
                    // Raced by a cancel or another executor; nothing to do.
                    info!(order_id = %order.id, status = %order.status, "Order no longer live");
                    tx.rollback().await?;
                    return Ok((ExecutionOutcome::Rejected, Vec::new()));
                }
                order
            }
            None => {
                // Fresh market order off the queue: materialize the row.
                let order = Order {
                    id: instruction.order_id,
                    user_id: instruction.user_id,
                    ticker_id: instruction.ticker_id.clone(),
                    side: instruction.side,
                    order_type: OrderType::Market,
                    status: OrderStatus::Pending,
                    quantity: instruction.quantity,
                    unfilled_quantity: instruction.quantity,
                    target_price: None,
                    stop_price: None,
                    trailing_gap: None,
                    high_water_mark: None,
                    price: None,
                    fee: Decimal::ZERO,
                    realized_pnl: None,
                    applied_exchange_rate: Decimal::ONE,
                    fail_reason: None,
                    created_at: Utc::now(),
                    filled_at: None,
                    cancelled_at: None,
                };
                tx.insert_order(&order).await?;
                order
            }
        };

        let settlement = match settle(SettlementInput {
            side: instruction.side,
            price,
            quantity: instruction.quantity,
            fee_rate,
            balance: wallet.balance,
            position_qty: position.quantity,
            average_price: position.average_price,
        }) {
            Ok(settlement) => settlement,
            Err(e) => {
                // Pre-trade shortfall: the FAILED status is the only thing
                // this transaction commits.
                tx.mark_order_failed(&order, &e.user_message()).await?;
                tx.commit().await?;
                warn!(order_id = %order.id, reason = %e, "Trade rejected");
                return Ok((ExecutionOutcome::Rejected, Vec::new()));
            }
        };

        let mut events = Vec::new();
        let mut wallet_delta = settlement.wallet_delta;

        // Profit realized by an active Human-ETF issuer is taxed for their
        // shareholders before the proceeds reach the seller.
        if instruction.side == OrderSide::Sell {
            if let Some(pnl) = settlement.realized_pnl.filter(|p| *p > Decimal::ZERO) {
                if let Some(user) = tx.user(instruction.user_id).await? {
                    if user.is_active && user.dividend_rate > Decimal::ZERO {
                        if let Some(withholding) =
                            DividendService::withhold(&mut tx, &user, pnl, wallet_delta).await?
                        {
                            wallet_delta -= withholding.withheld;
                            events.push(Publish::Human(withholding.event));
                        }
                    }
                }
            }
        }

        tx.set_wallet_balance(
            &wallet,
            wallet.balance + wallet_delta,
            settlement.wallet_reason,
        )
        .await?;
        tx.write_position(
            &position,
            row_exists,
            settlement.new_quantity,
            settlement.new_average_price,
            settlement.wallet_reason,
        )
        .await?;
        tx.mark_order_filled(&order, price, settlement.fee, settlement.realized_pnl)
            .await?;
        tx.commit().await?;

        info!(
            order_id = %order.id,
            ticker_id = %instruction.ticker_id,
            side = %instruction.side,
            quantity = %instruction.quantity,
            price = %price,
            fee = %settlement.fee,
            "Trade executed"
        );

        events.push(Publish::Trade(TradeEvent::TradeExecuted {
            user_id: instruction.user_id,
            order_id: order.id,
            ticker_id: instruction.ticker_id.clone(),
            side: instruction.side,
            quantity: instruction.quantity,
            price,
            fee: settlement.fee,
            realized_pnl: settlement.realized_pnl,
            status: OrderStatus::Filled,
        }));

        Ok((ExecutionOutcome::Filled, events))
    }

    /// Fill price resolution: VWAP over the opposite book side when the
    /// snapshot covers the full quantity, else the matcher's tick, else the
    /// last published price.
    async fn resolve_price(
        &self,
        instruction: &TradeInstruction,
        price_hint: Option<Decimal>,
    ) -> Result<Option<Decimal>, EngineError> {
        let vwap = match self.prices.orderbook(&instruction.ticker_id).await? {
            Some(book) => match instruction.side {
                OrderSide::Buy => vwap_fill_price(&book.asks, instruction.quantity, true),
                OrderSide::Sell => vwap_fill_price(&book.bids, instruction.quantity, false),
            },
            None => None,
        };

        if vwap.is_some() {
            return Ok(vwap);
        }
        if price_hint.is_some() {
            return Ok(price_hint);
        }
        self.prices.current_price(&instruction.ticker_id).await
    }

    /// Settles one planned P2P fill between two resting orders. Returns
    /// false when the match can no longer be honored (raced cancel, buyer
    /// shortfall); the matcher stops its drain loop for this ticker.
    pub async fn execute_p2p(&self, plan: &MatchPlan) -> Result<bool, EngineError> {
        let fee_rate = self.prices.trading_fee_rate().await?;
        let mut tx = self.ledger.begin().await?;

        // Discover the two parties before locking anything.
        let Some(buy_probe) = tx.order(plan.buy_order_id).await? else {
            return Ok(false);
        };
        let Some(sell_probe) = tx.order(plan.sell_order_id).await? else {
            return Ok(false);
        };

        if buy_probe.user_id == sell_probe.user_id {
            // A self-cross would settle both legs against the same wallet
            // and position rows; skip it rather than double-count.
            warn!(
                user_id = %buy_probe.user_id,
                ticker_id = %buy_probe.ticker_id,
                "Skipping self-crossing match"
            );
            return Ok(false);
        }

        let ticker_id = buy_probe.ticker_id.clone();
        let buyer_first = buy_probe.user_id < sell_probe.user_id;

        // Wallets ascend by user id, then positions the same way, then the
        // order rows ascend by order id.
        let lock_wallet_pair = |wallet: Option<crate::domain::asset::Wallet>| {
            wallet.ok_or(EngineError::WalletNotFound)
        };
        let (buyer_wallet, seller_wallet) = if buyer_first {
            let b = lock_wallet_pair(tx.lock_wallet(buy_probe.user_id).await?)?;
            let s = lock_wallet_pair(tx.lock_wallet(sell_probe.user_id).await?)?;
            (b, s)
        } else {
            let s = lock_wallet_pair(tx.lock_wallet(sell_probe.user_id).await?)?;
            let b = lock_wallet_pair(tx.lock_wallet(buy_probe.user_id).await?)?;
            (b, s)
        };

        let ((buyer_position, buyer_row), (seller_position, seller_row)) = if buyer_first {
            let b = tx.lock_position(buy_probe.user_id, &ticker_id).await?;
            let s = tx.lock_position(sell_probe.user_id, &ticker_id).await?;
            (b, s)
        } else {
            let s = tx.lock_position(sell_probe.user_id, &ticker_id).await?;
            let b = tx.lock_position(buy_probe.user_id, &ticker_id).await?;
            (b, s)
        };

        let buy_first = plan.buy_order_id < plan.sell_order_id;
        let (buy_order, sell_order) = if buy_first {
            let b = tx.lock_order(plan.buy_order_id).await?;
            let s = tx.lock_order(plan.sell_order_id).await?;
            (b, s)
        } else {
            let s = tx.lock_order(plan.sell_order_id).await?;
            let b = tx.lock_order(plan.buy_order_id).await?;
            (b, s)
        };
        let (Some(buy_order), Some(sell_order)) = (buy_order, sell_order) else {
            return Ok(false);
        };

        // Re-verify under lock: the plan was computed from a snapshot.
        if buy_order.status != OrderStatus::Pending || sell_order.status != OrderStatus::Pending {
            return Ok(false);
        }
        if buy_order.unfilled_quantity < plan.quantity
            || sell_order.unfilled_quantity < plan.quantity
        {
            return Ok(false);
        }

        let buyer_settlement = match settle(SettlementInput {
            side: OrderSide::Buy,
            price: plan.price,
            quantity: plan.quantity,
            fee_rate,
            balance: buyer_wallet.balance,
            position_qty: buyer_position.quantity,
            average_price: buyer_position.average_price,
        }) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    buy_order_id = %buy_order.id,
                    reason = %e,
                    "P2P match abandoned: buyer cannot fund the fill"
                );
                return Ok(false);
            }
        };
        let seller_settlement = settle(SettlementInput {
            side: OrderSide::Sell,
            price: plan.price,
            quantity: plan.quantity,
            fee_rate,
            balance: seller_wallet.balance,
            position_qty: seller_position.quantity,
            average_price: seller_position.average_price,
        })?;

        self.apply_side(&mut tx, &buyer_wallet, &buyer_position, buyer_row, &buyer_settlement)
            .await?;
        self.apply_side(
            &mut tx,
            &seller_wallet,
            &seller_position,
            seller_row,
            &seller_settlement,
        )
        .await?;

        let buy_status = tx
            .apply_p2p_fill(
                &buy_order,
                plan.quantity,
                plan.price,
                buyer_settlement.fee,
                buyer_settlement.realized_pnl,
            )
            .await?;
        let sell_status = tx
            .apply_p2p_fill(
                &sell_order,
                plan.quantity,
                plan.price,
                seller_settlement.fee,
                seller_settlement.realized_pnl,
            )
            .await?;

        tx.commit().await?;

        info!(
            ticker_id = %ticker_id,
            quantity = %plan.quantity,
            price = %plan.price,
            buy_order_id = %buy_order.id,
            sell_order_id = %sell_order.id,
            "P2P trade settled"
        );

        self.publish_all(vec![
            Publish::Trade(TradeEvent::TradeExecuted {
                user_id: buy_order.user_id,
                order_id: buy_order.id,
                ticker_id: ticker_id.clone(),
                side: OrderSide::Buy,
                quantity: plan.quantity,
                price: plan.price,
                fee: buyer_settlement.fee,
                realized_pnl: buyer_settlement.realized_pnl,
                status: buy_status,
            }),
            Publish::Trade(TradeEvent::TradeExecuted {
                user_id: sell_order.user_id,
                order_id: sell_order.id,
                ticker_id,
                side: OrderSide::Sell,
                quantity: plan.quantity,
                price: plan.price,
                fee: seller_settlement.fee,
                realized_pnl: seller_settlement.realized_pnl,
                status: sell_status,
            }),
        ])
        .await;

        Ok(true)
    }

    async fn apply_side(
        &self,
        tx: &mut LedgerTx,
        wallet: &crate::domain::asset::Wallet,
        position: &crate::domain::asset::Position,
        row_exists: bool,
        settlement: &Settlement,
    ) -> Result<(), EngineError> {
        tx.set_wallet_balance(
            wallet,
            wallet.balance + settlement.wallet_delta,
            settlement.wallet_reason,
        )
        .await?;
        tx.write_position(
            position,
            row_exists,
            settlement.new_quantity,
            settlement.new_average_price,
            settlement.wallet_reason,
        )
        .await
    }

    /// Marks an order FAILED in its own transaction, outside the one that
    /// just rolled back. Best effort: a failure here only logs.
    async fn mark_failed_detached(&self, order_id: Uuid, reason: &str) {
        let result: Result<(), EngineError> = async {
            let mut tx = self.ledger.begin().await?;
            if let Some(order) = tx.lock_order(order_id).await? {
                if !order.status.is_terminal() {
                    tx.mark_order_failed(&order, reason).await?;
                    tx.commit().await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(order_id = %order_id, error = %e, "Could not record order failure");
        }
    }

    async fn publish_all(&self, events: Vec<Publish>) {
        for event in events {
            let result = match &event {
                Publish::Trade(e) => self.bus.publish(CHANNEL_TRADE_EVENTS, e).await,
                Publish::Human(e) => self.bus.publish(CHANNEL_HUMAN_EVENTS, e).await,
            };
            if let Err(e) = result {
                // State is committed; losing an event is log-worthy but not
                // a rollback condition.
                warn!(error = %e, "Failed to publish post-commit event");
            }
        }
    }
}
