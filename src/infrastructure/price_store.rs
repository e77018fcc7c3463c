//! Redis-backed market data reads shared by the executor and matchers.
//!
//! Key layout:
//!   `price:{ticker_id}`          JSON {ticker_id, price, timestamp}
//!   `orderbook:{ticker_id}`      JSON {asks: [{price, qty}], bids: [{price, qty}]}
//!   `config:trading_fee_rate`    decimal string, default "0.001"

use crate::domain::errors::EngineError;
use crate::domain::events::{PriceUpdate, CHANNEL_PRICE_UPDATES};
use crate::domain::types::DEFAULT_TRADING_FEE_RATE;
use anyhow::Context;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

pub const PRICE_KEY_PREFIX: &str = "price:";
pub const ORDERBOOK_KEY_PREFIX: &str = "orderbook:";
pub const FEE_RATE_KEY: &str = "config:trading_fee_rate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Depth snapshot for VWAP fills. Asks ascend, bids descend; consumers sort
/// defensively anyway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub asks: Vec<BookLevel>,
    pub bids: Vec<BookLevel>,
}

#[derive(Clone)]
pub struct PriceStore {
    conn: ConnectionManager,
}

impl PriceStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Current price of a ticker, if a quote has ever been published.
    pub async fn current_price(&self, ticker_id: &str) -> Result<Option<Decimal>, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(format!("{PRICE_KEY_PREFIX}{ticker_id}")).await?;

        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str::<PriceUpdate>(&raw) {
            Ok(update) => Ok(Some(update.price)),
            Err(e) => {
                warn!(ticker_id, error = %e, "Malformed price entry; treating as missing");
                Ok(None)
            }
        }
    }

    /// Publishes a new last price: updates the key and emits a tick on the
    /// price channel. Used by the P2P matcher after fills.
    pub async fn publish_price(&self, ticker_id: &str, price: Decimal) -> Result<(), EngineError> {
        let update = PriceUpdate {
            ticker_id: ticker_id.to_string(),
            price,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&update)
            .map_err(|e| EngineError::System(anyhow::Error::new(e)))?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .set(format!("{PRICE_KEY_PREFIX}{ticker_id}"), &payload)
            .await?;
        let _: () = conn.publish(CHANNEL_PRICE_UPDATES, &payload).await?;
        Ok(())
    }

    pub async fn orderbook(
        &self,
        ticker_id: &str,
    ) -> Result<Option<OrderBookSnapshot>, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(format!("{ORDERBOOK_KEY_PREFIX}{ticker_id}"))
            .await?;

        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str::<OrderBookSnapshot>(&raw) {
            Ok(book) => Ok(Some(book)),
            Err(e) => {
                warn!(ticker_id, error = %e, "Malformed orderbook entry; ignoring");
                Ok(None)
            }
        }
    }

    /// Trading fee rate from config, defaulting to 0.001.
    pub async fn trading_fee_rate(&self) -> Result<Decimal, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(FEE_RATE_KEY).await?;

        Ok(match raw {
            Some(value) => Decimal::from_str(value.trim()).unwrap_or_else(|_| {
                warn!(%value, "Unparseable fee rate in config; using default");
                DEFAULT_TRADING_FEE_RATE
            }),
            None => DEFAULT_TRADING_FEE_RATE,
        })
    }
}

/// VWAP across the opposite book side for a fill of `quantity`. BUY consumes
/// asks cheapest-first, SELL consumes bids richest-first. Returns None when
/// the book cannot cover the full quantity; the caller falls back to the
/// last price.
pub fn vwap_fill_price(
    levels: &[BookLevel],
    quantity: Decimal,
    ascending: bool,
) -> Option<Decimal> {
    if quantity <= Decimal::ZERO {
        return None;
    }

    let mut sorted: Vec<&BookLevel> = levels.iter().filter(|l| l.qty > Decimal::ZERO).collect();
    sorted.sort_by(|a, b| {
        if ascending {
            a.price.cmp(&b.price)
        } else {
            b.price.cmp(&a.price)
        }
    });

    let mut remaining = quantity;
    let mut notional = Decimal::ZERO;

    for level in sorted {
        let take = remaining.min(level.qty);
        notional += take * level.price;
        remaining -= take;
        if remaining <= Decimal::ZERO {
            return Some(notional / quantity);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, qty: Decimal) -> BookLevel {
        BookLevel { price, qty }
    }

    #[test]
    fn test_vwap_buy_consumes_asks_cheapest_first() {
        // Asks intentionally out of order.
        let asks = vec![
            level(dec!(102), dec!(5)),
            level(dec!(100), dec!(2)),
            level(dec!(101), dec!(3)),
        ];

        // 4 units: 2 @ 100 + 2 @ 101 = 402 / 4 = 100.5
        assert_eq!(vwap_fill_price(&asks, dec!(4), true), Some(dec!(100.5)));
    }

    #[test]
    fn test_vwap_sell_consumes_bids_richest_first() {
        let bids = vec![level(dec!(98), dec!(10)), level(dec!(99), dec!(1))];

        // 2 units: 1 @ 99 + 1 @ 98 = 197 / 2 = 98.5
        assert_eq!(vwap_fill_price(&bids, dec!(2), false), Some(dec!(98.5)));
    }

    #[test]
    fn test_vwap_insufficient_depth() {
        let asks = vec![level(dec!(100), dec!(1))];
        assert_eq!(vwap_fill_price(&asks, dec!(2), true), None);
        assert_eq!(vwap_fill_price(&[], dec!(1), true), None);
    }

    #[test]
    fn test_vwap_ignores_empty_levels() {
        let asks = vec![level(dec!(100), dec!(0)), level(dec!(101), dec!(2))];
        assert_eq!(vwap_fill_price(&asks, dec!(2), true), Some(dec!(101)));
    }

    #[test]
    fn test_vwap_rejects_non_positive_quantity() {
        let asks = vec![level(dec!(100), dec!(5))];
        assert_eq!(vwap_fill_price(&asks, dec!(0), true), None);
    }
}
