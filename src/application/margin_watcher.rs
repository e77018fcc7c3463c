//! Forced liquidation of under-margined short holders.
//!
//! Every price tick re-assesses the equity of users short the moving ticker.
//! Below maintenance, the whole account is closed mark-to-market in one
//! transaction and a negative residue is floored to zero. Concurrent checks
//! of the same user serialize on the wallet row lock.

use crate::domain::errors::EngineError;
use crate::domain::events::{LiquidationEvent, PriceUpdate, CHANNEL_LIQUIDATION_EVENTS};
use crate::domain::margin::{assess_equity, requires_liquidation, EquityBreakdown};
use crate::domain::types::{WALLET_REASON_LIQUIDATION_RESET, WALLET_REASON_LIQUIDATION_SETTLE};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::ledger::Ledger;
use crate::infrastructure::price_store::PriceStore;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

pub struct MarginWatcher {
    ledger: Ledger,
    prices: PriceStore,
    bus: EventBus,
}

impl MarginWatcher {
    pub fn new(ledger: Ledger, prices: PriceStore, bus: EventBus) -> Self {
        Self {
            ledger,
            prices,
            bus,
        }
    }

    pub async fn run(
        &self,
        mut ticks: tokio::sync::mpsc::Receiver<PriceUpdate>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!("Margin watcher waiting for price updates");
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    let Some(tick) = tick else { break };
                    if let Err(e) = self.handle_tick(&tick.ticker_id).await {
                        warn!(ticker_id = %tick.ticker_id, error = %e, "Margin check failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Margin watcher stopped");
    }

    /// Re-checks everyone short the ticker that just moved.
    pub async fn handle_tick(&self, ticker_id: &str) -> Result<(), EngineError> {
        let holders = self.ledger.short_holders(ticker_id).await?;
        for user_id in holders {
            if let Err(e) = self.check_user(user_id, ticker_id).await {
                warn!(user_id = %user_id, error = %e, "Liquidation check failed");
            }
        }
        Ok(())
    }

    async fn check_user(&self, user_id: Uuid, trigger_ticker: &str) -> Result<(), EngineError> {
        let Some(wallet) = self.ledger.wallet_of(user_id).await? else {
            return Ok(());
        };
        let positions = self.ledger.positions_of(user_id).await?;
        if positions.is_empty() {
            return Ok(());
        }

        let prices = self.snapshot_prices(&positions).await?;
        let breakdown = assess_equity(wallet.balance, &positions, &prices);

        if !requires_liquidation(&breakdown) {
            return Ok(());
        }

        warn!(
            user_id = %user_id,
            equity = %breakdown.net_equity,
            liability = %breakdown.short_liability,
            "Margin call: liquidating account"
        );

        self.liquidate_all(user_id, trigger_ticker, &breakdown).await
    }

    async fn snapshot_prices(
        &self,
        positions: &[crate::domain::asset::Position],
    ) -> Result<HashMap<String, Decimal>, EngineError> {
        let mut prices = HashMap::new();
        for position in positions {
            if let Some(price) = self.prices.current_price(&position.ticker_id).await? {
                prices.insert(position.ticker_id.clone(), price);
            }
        }
        Ok(prices)
    }

    /// Closes every position mark-to-market in one transaction. The cash
    /// settlement lands as a single wallet write; a negative result is then
    /// floored to zero in a second, separately audited write.
    async fn liquidate_all(
        &self,
        user_id: Uuid,
        trigger_ticker: &str,
        breakdown: &EquityBreakdown,
    ) -> Result<(), EngineError> {
        let mut tx = self.ledger.begin().await?;

        // The wallet lock serializes concurrent watcher invocations.
        let Some(wallet) = tx.lock_wallet(user_id).await? else {
            return Ok(());
        };
        let positions = tx.lock_positions_of(user_id).await?;
        if positions.is_empty() {
            return Ok(());
        }

        let prices = self.snapshot_prices(&positions).await?;

        let mut proceeds = Decimal::ZERO;
        for position in &positions {
            let price = prices
                .get(&position.ticker_id)
                .copied()
                .unwrap_or(position.average_price);
            proceeds += position.quantity * price;

            tx.write_position(
                position,
                true,
                Decimal::ZERO,
                Decimal::ZERO,
                WALLET_REASON_LIQUIDATION_SETTLE,
            )
            .await?;
        }

        let settled_balance = wallet.balance + proceeds;
        let wallet = tx
            .set_wallet_balance(&wallet, settled_balance, WALLET_REASON_LIQUIDATION_SETTLE)
            .await?;

        if settled_balance < Decimal::ZERO {
            info!(
                user_id = %user_id,
                balance = %settled_balance,
                "Negative balance after liquidation; flooring to zero"
            );
            tx.set_wallet_balance(&wallet, Decimal::ZERO, WALLET_REASON_LIQUIDATION_RESET)
                .await?;
        }

        tx.commit().await?;

        info!(user_id = %user_id, proceeds = %proceeds, "Account liquidated");

        if let Err(e) = self
            .bus
            .publish(
                CHANNEL_LIQUIDATION_EVENTS,
                &LiquidationEvent {
                    user_id,
                    ticker_id: trigger_ticker.to_string(),
                    equity: breakdown.net_equity,
                    liability: breakdown.short_liability,
                },
            )
            .await
        {
            warn!(user_id = %user_id, error = %e, "Liquidation event not published");
        }

        Ok(())
    }
}
