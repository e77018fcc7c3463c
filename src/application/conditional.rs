//! Conditional-order matching against the live price stream.
//!
//! Each tick scans the cache's four indexes for candidates, re-reads every
//! candidate from the ledger, re-verifies its condition, and either promotes
//! it (STOP_LIMIT) or hands it to the executor with the tick as the fill
//! hint. Trailing stops ratchet on every tick. Cache coherence comes from
//! consuming the trade-event channel rather than sweeping the ledger.

use crate::application::executor::{ExecutionOutcome, TradeExecutor};
use crate::domain::errors::EngineError;
use crate::domain::events::{PriceUpdate, TradeEvent};
use crate::domain::matching::{is_triggered, next_trailing_stop};
use crate::domain::order::{Order, TradeInstruction};
use crate::domain::types::{OrderSide, OrderStatus, OrderType};
use crate::infrastructure::order_cache::{IndexGroup, OrderBookCache};
use crate::infrastructure::persistence::ledger::Ledger;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ConditionalMatcher {
    ledger: Ledger,
    cache: OrderBookCache,
    executor: TradeExecutor,
}

impl ConditionalMatcher {
    pub fn new(ledger: Ledger, cache: OrderBookCache, executor: TradeExecutor) -> Self {
        Self {
            ledger,
            cache,
            executor,
        }
    }

    /// Consumes ticks and order events until both channels close or shutdown
    /// flips. One tick is fully processed before the next is taken.
    pub async fn run(
        &self,
        mut ticks: tokio::sync::mpsc::Receiver<PriceUpdate>,
        mut order_events: tokio::sync::mpsc::Receiver<TradeEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!("Conditional matcher watching for triggers");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                tick = ticks.recv() => {
                    let Some(tick) = tick else { break };
                    if let Err(e) = self.handle_tick(&tick.ticker_id, tick.price).await {
                        warn!(ticker_id = %tick.ticker_id, error = %e, "Tick processing failed");
                    }
                }
                event = order_events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.handle_order_event(&event).await {
                        warn!(order_id = %event.order_id(), error = %e, "Event processing failed");
                    }
                }
            }
        }
        info!("Conditional matcher stopped");
    }

    /// Keeps the cache coherent with ledger lifecycle events.
    pub async fn handle_order_event(&self, event: &TradeEvent) -> Result<(), EngineError> {
        match event {
            TradeEvent::OrderCreated { order_id, .. } => {
                if let Some(order) = self.ledger.order(*order_id).await? {
                    self.cache.add_order(&order).await?;
                }
            }
            TradeEvent::OrderCancelled {
                order_id,
                ticker_id,
                ..
            }
            | TradeEvent::TradeExecuted {
                order_id,
                ticker_id,
                ..
            } => {
                self.cache.remove_order(*order_id, ticker_id).await?;
            }
        }
        Ok(())
    }

    /// Evaluates one tick for one ticker: collect candidates across the four
    /// indexes, fire them in creation order, then ratchet trailing stops.
    pub async fn handle_tick(&self, ticker_id: &str, price: Decimal) -> Result<(), EngineError> {
        let mut candidate_ids: Vec<Uuid> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();

        for (group, side) in [
            (IndexGroup::Limit, OrderSide::Buy),
            (IndexGroup::Limit, OrderSide::Sell),
            (IndexGroup::Stop, OrderSide::Buy),
            (IndexGroup::Stop, OrderSide::Sell),
        ] {
            for id in self
                .cache
                .fetch_candidates(ticker_id, side, group, price)
                .await?
            {
                if seen.insert(id) {
                    candidate_ids.push(id);
                }
            }
        }

        if !candidate_ids.is_empty() {
            // Fresh ledger rows, processed strictly by creation time.
            let mut orders: Vec<Order> = Vec::with_capacity(candidate_ids.len());
            for id in candidate_ids {
                match self.ledger.order(id).await? {
                    Some(order) => orders.push(order),
                    None => {
                        // Cache drift: the row is gone.
                        self.cache.remove_order(id, ticker_id).await?;
                    }
                }
            }
            orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            for order in orders {
                if order.status != OrderStatus::Pending {
                    self.cache.remove_order(order.id, ticker_id).await?;
                    continue;
                }
                if !is_triggered(&order, price) {
                    debug!(order_id = %order.id, "Condition not met on re-check");
                    continue;
                }

                if order.order_type == OrderType::StopLimit {
                    self.promote_stop_limit(&order).await?;
                    continue;
                }

                info!(
                    order_id = %order.id,
                    order_type = %order.order_type,
                    side = %order.side,
                    tick = %price,
                    "Conditional order triggered"
                );

                let instruction = TradeInstruction {
                    order_id: order.id,
                    user_id: order.user_id,
                    ticker_id: order.ticker_id.clone(),
                    side: order.side,
                    quantity: order.quantity,
                };
                match self.executor.execute_trade(&instruction, Some(price)).await {
                    Ok(ExecutionOutcome::Filled) | Ok(ExecutionOutcome::Handoff) => {
                        self.cache.remove_order(order.id, ticker_id).await?;
                    }
                    Ok(ExecutionOutcome::Rejected) => {
                        warn!(order_id = %order.id, "Trigger execution rejected");
                    }
                    Err(e) => {
                        warn!(order_id = %order.id, error = %e, "Trigger execution errored");
                    }
                }
            }
        }

        self.maintain_trailing_stops(ticker_id, price).await
    }

    /// STOP_LIMIT promotion: re-type to LIMIT under the order lock and
    /// re-index. The promoted order waits for the next tick.
    async fn promote_stop_limit(&self, order: &Order) -> Result<(), EngineError> {
        let mut tx = self.ledger.begin().await?;
        let Some(current) = tx.lock_order(order.id).await? else {
            return Ok(());
        };
        if current.status != OrderStatus::Pending || current.order_type != OrderType::StopLimit {
            return Ok(());
        }

        tx.promote_stop_limit(&current).await?;
        tx.commit().await?;
        self.cache.reindex_promoted(&current).await?;

        info!(
            order_id = %order.id,
            target_price = ?order.target_price,
            "Stop-limit promoted to resting limit"
        );
        Ok(())
    }

    /// Ratchets every PENDING trailing stop on this ticker toward the tick.
    async fn maintain_trailing_stops(
        &self,
        ticker_id: &str,
        price: Decimal,
    ) -> Result<(), EngineError> {
        let trailing = self.ledger.pending_trailing_stops(ticker_id).await?;

        for order in trailing {
            let (Some(gap), Some(stop)) = (order.trailing_gap, order.stop_price) else {
                continue;
            };
            if next_trailing_stop(order.side, price, gap, stop).is_none() {
                continue;
            }

            let mut tx = self.ledger.begin().await?;
            let Some(current) = tx.lock_order(order.id).await? else {
                continue;
            };
            if current.status != OrderStatus::Pending
                || current.order_type != OrderType::TrailingStop
            {
                continue;
            }
            // Re-derive against the locked row; another tick may have moved it.
            let Some(stop) = current.stop_price else { continue };
            let Some(new_stop) = next_trailing_stop(current.side, price, gap, stop) else {
                continue;
            };

            tx.update_trailing_stop(&current, new_stop, price).await?;
            tx.commit().await?;

            let mut rescored = current.clone();
            rescored.stop_price = Some(new_stop);
            rescored.high_water_mark = Some(price);
            self.cache.add_order(&rescored).await?;

            debug!(
                order_id = %order.id,
                new_stop = %new_stop,
                "Trailing stop ratcheted"
            );
        }
        Ok(())
    }
}
