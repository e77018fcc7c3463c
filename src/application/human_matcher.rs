//! P2P matcher for Human-ETF instruments.
//!
//! Polls each HUMAN ticker about once a second, drains crossable orders
//! under price-time priority, and after every fill maintains the 1m/1d
//! candles and republishes the match price as the ticker's last price.

use crate::application::executor::TradeExecutor;
use crate::domain::errors::EngineError;
use crate::domain::matching::{plan_p2p_match, NoMatch};
use crate::infrastructure::persistence::ledger::Ledger;
use crate::infrastructure::price_store::PriceStore;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{info, warn};

pub struct HumanMatcher {
    ledger: Ledger,
    executor: TradeExecutor,
    prices: PriceStore,
    poll_interval: Duration,
}

impl HumanMatcher {
    pub fn new(
        ledger: Ledger,
        executor: TradeExecutor,
        prices: PriceStore,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            executor,
            prices,
            poll_interval,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Human-ETF matcher polling for P2P matches");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Matching sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Human-ETF matcher stopped");
    }

    /// One full pass over every active HUMAN ticker, draining each book
    /// until nothing crosses.
    pub async fn sweep(&self) -> Result<(), EngineError> {
        for ticker_id in self.ledger.active_human_tickers().await? {
            self.drain_ticker(&ticker_id).await?;
        }
        Ok(())
    }

    async fn drain_ticker(&self, ticker_id: &str) -> Result<(), EngineError> {
        loop {
            let pending = self.ledger.pending_orders(ticker_id).await?;

            let plan = match plan_p2p_match(&pending) {
                Ok(plan) => plan,
                Err(NoMatch::MarketOnly) => {
                    warn!(ticker_id, "Best buy and sell are both MARKET; no reference price");
                    break;
                }
                Err(NoMatch::NoCross) => break,
            };

            info!(
                ticker_id,
                quantity = %plan.quantity,
                price = %plan.price,
                "Crossing orders found"
            );

            if !self.executor.execute_p2p(&plan).await? {
                // Settlement declined (raced cancel or funds); stop draining
                // this ticker until the book changes.
                break;
            }

            self.record_fill(ticker_id, plan.price, plan.quantity).await?;
        }
        Ok(())
    }

    /// Post-fill upkeep: candle buckets and last-price publication. The
    /// price tick also wakes the margin watcher for this ticker.
    async fn record_fill(
        &self,
        ticker_id: &str,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        self.update_candles(ticker_id, price, quantity, now).await?;
        self.prices.publish_price(ticker_id, price).await
    }

    async fn update_candles(
        &self,
        ticker_id: &str,
        price: Decimal,
        quantity: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let minute = at
            .duration_trunc(ChronoDuration::minutes(1))
            .map_err(|e| EngineError::System(anyhow::anyhow!(e)))?;
        let day = at
            .duration_trunc(ChronoDuration::days(1))
            .map_err(|e| EngineError::System(anyhow::anyhow!(e)))?;

        let mut tx = self.ledger.begin().await?;
        tx.upsert_candle(ticker_id, "1m", minute, price, quantity)
            .await?;
        tx.upsert_candle(ticker_id, "1d", day, price, quantity)
            .await?;
        tx.commit().await
    }
}
