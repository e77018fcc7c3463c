//! Hot index of pending conditional orders, mirrored from the ledger.
//!
//! Per ticker, four sorted sets score order ids by their trigger price:
//!   `oo:limit:{ticker}:{buy|sell}`   score = target_price
//!   `oo:stop:{ticker}:{buy|sell}`    score = stop_price
//! plus a hash per order with its full attributes and a set of hydrated
//! tickers. First access to a ticker lazily loads its PENDING conditionals
//! from the ledger under a short-TTL lock so exactly one worker hydrates.

use crate::domain::errors::EngineError;
use crate::domain::order::Order;
use crate::domain::types::{OrderSide, OrderStatus, OrderType};
use crate::infrastructure::persistence::ledger::Ledger;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LIMIT_KEY: &str = "oo:limit";
const STOP_KEY: &str = "oo:stop";
const DATA_KEY: &str = "oo:data";
const LOADED_TICKERS_KEY: &str = "oo:loaded_tickers";
const LOAD_LOCK_KEY: &str = "oo:lock:load";

/// Which sorted-set family a scan targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexGroup {
    Limit,
    Stop,
}

fn side_slug(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn index_key(group: IndexGroup, ticker_id: &str, side: OrderSide) -> String {
    let prefix = match group {
        IndexGroup::Limit => LIMIT_KEY,
        IndexGroup::Stop => STOP_KEY,
    };
    format!("{prefix}:{ticker_id}:{}", side_slug(side))
}

fn data_key(order_id: Uuid) -> String {
    format!("{DATA_KEY}:{order_id}")
}

/// Order attributes mirrored into the cache hash. The matcher re-reads the
/// ledger row before acting; the hash serves candidate selection and
/// operational inspection of the resting book.
#[derive(Debug, Clone, PartialEq)]
struct CachedOrder {
    id: Uuid,
    user_id: Uuid,
    ticker_id: String,
    side: OrderSide,
    order_type: OrderType,
    quantity: Decimal,
    target_price: Option<Decimal>,
    stop_price: Option<Decimal>,
}

impl CachedOrder {
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.to_string()),
            ("user_id", self.user_id.to_string()),
            ("ticker_id", self.ticker_id.clone()),
            ("side", self.side.as_str().to_string()),
            ("type", self.order_type.as_str().to_string()),
            ("quantity", self.quantity.to_string()),
        ];
        if let Some(target) = self.target_price {
            fields.push(("target_price", target.to_string()));
        }
        if let Some(stop) = self.stop_price {
            fields.push(("stop_price", stop.to_string()));
        }
        fields
    }

    fn from_order(order: &Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            ticker_id: order.ticker_id.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            target_price: order.target_price,
            stop_price: order.stop_price,
        }
    }
}

#[derive(Clone)]
pub struct OrderBookCache {
    conn: ConnectionManager,
    ledger: Ledger,
    lock_ttl_ms: u64,
    hydrated: Arc<Mutex<HashSet<String>>>,
}

impl OrderBookCache {
    pub fn new(conn: ConnectionManager, ledger: Ledger, lock_ttl_ms: u64) -> Self {
        Self {
            conn,
            ledger,
            lock_ttl_ms,
            hydrated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Indexes a PENDING conditional order. Non-pending and market orders
    /// are ignored so stale events cannot resurrect entries.
    pub async fn add_order(&self, order: &Order) -> Result<(), EngineError> {
        if order.status != OrderStatus::Pending || !order.order_type.is_conditional() {
            return Ok(());
        }
        let Some(score) = order.cache_score() else {
            warn!(order_id = %order.id, "Conditional order without a score; not indexing");
            return Ok(());
        };
        let Some(score) = score.to_f64() else {
            warn!(order_id = %order.id, "Score not representable; not indexing");
            return Ok(());
        };

        let group = if order.order_type == OrderType::Limit {
            IndexGroup::Limit
        } else {
            IndexGroup::Stop
        };
        let key = index_key(group, &order.ticker_id, order.side);
        let cached = CachedOrder::from_order(order);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(data_key(order.id), &cached.fields());
        pipe.zadd(key, order.id.to_string(), score);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Drops an order from the data hash and all four indexes of its ticker.
    pub async fn remove_order(&self, order_id: Uuid, ticker_id: &str) -> Result<(), EngineError> {
        let member = order_id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(data_key(order_id));
        for group in [IndexGroup::Limit, IndexGroup::Stop] {
            for side in [OrderSide::Buy, OrderSide::Sell] {
                pipe.zrem(index_key(group, ticker_id, side), &member);
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Moves a promoted STOP_LIMIT from the stop index to the limit index.
    pub async fn reindex_promoted(&self, order: &Order) -> Result<(), EngineError> {
        self.remove_order(order.id, &order.ticker_id).await?;
        let mut promoted = order.clone();
        promoted.order_type = OrderType::Limit;
        self.add_order(&promoted).await
    }

    /// Candidate order ids whose trigger condition holds at `price`:
    ///   LIMIT BUY   target >= price   [price, +inf)
    ///   LIMIT SELL  target <= price   (-inf, price]
    ///   STOP  BUY   stop   <= price   (-inf, price]
    ///   STOP  SELL  stop   >= price   [price, +inf)
    pub async fn fetch_candidates(
        &self,
        ticker_id: &str,
        side: OrderSide,
        group: IndexGroup,
        price: Decimal,
    ) -> Result<Vec<Uuid>, EngineError> {
        self.ensure_hydrated(ticker_id).await?;

        let key = index_key(group, ticker_id, side);
        let score = price
            .to_f64()
            .ok_or_else(|| EngineError::System(anyhow::anyhow!("price not representable")))?;

        let upward = matches!(
            (group, side),
            (IndexGroup::Limit, OrderSide::Buy) | (IndexGroup::Stop, OrderSide::Sell)
        );

        let mut conn = self.conn.clone();
        let members: Vec<String> = if upward {
            conn.zrangebyscore(key, score, f64::INFINITY).await?
        } else {
            conn.zrangebyscore(key, f64::NEG_INFINITY, score).await?
        };

        Ok(members
            .into_iter()
            .filter_map(|m| Uuid::parse_str(&m).ok())
            .collect())
    }

    /// Lazily hydrates one ticker's index from the ledger, coordinated with
    /// other workers through a short-TTL lock so the load runs exactly once.
    async fn ensure_hydrated(&self, ticker_id: &str) -> Result<(), EngineError> {
        {
            let local = self.hydrated.lock().await;
            if local.contains(ticker_id) {
                return Ok(());
            }
        }

        let mut conn = self.conn.clone();
        let loaded: bool = conn.sismember(LOADED_TICKERS_KEY, ticker_id).await?;
        if loaded {
            self.hydrated.lock().await.insert(ticker_id.to_string());
            return Ok(());
        }

        let lock_key = format!("{LOAD_LOCK_KEY}:{ticker_id}");
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(self.lock_ttl_ms)
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            // Another worker is loading; candidates may miss this tick and
            // catch the next one.
            debug!(ticker_id, "Hydration in progress elsewhere; skipping");
            return Ok(());
        }

        // Double-check under the lock.
        let loaded: bool = conn.sismember(LOADED_TICKERS_KEY, ticker_id).await?;
        if !loaded {
            info!(ticker_id, "Hydrating conditional order cache");
            let orders = self.ledger.pending_conditionals(ticker_id).await?;
            for order in &orders {
                self.add_order(order).await?;
            }
            let _: () = conn.sadd(LOADED_TICKERS_KEY, ticker_id).await?;
        }
        let _: () = conn.del(&lock_key).await?;

        self.hydrated.lock().await.insert(ticker_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_layout() {
        assert_eq!(
            index_key(IndexGroup::Limit, "CRYPTO-BTC", OrderSide::Buy),
            "oo:limit:CRYPTO-BTC:buy"
        );
        assert_eq!(
            index_key(IndexGroup::Stop, "CRYPTO-BTC", OrderSide::Sell),
            "oo:stop:CRYPTO-BTC:sell"
        );
    }

    #[test]
    fn test_cached_order_fields_omit_missing_prices() {
        let cached = CachedOrder {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            ticker_id: "KRX-005930".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::StopLoss,
            quantity: Decimal::ONE,
            target_price: None,
            stop_price: Some(Decimal::from(90)),
        };
        let fields = cached.fields();
        assert!(fields.iter().any(|(k, _)| *k == "stop_price"));
        assert!(!fields.iter().any(|(k, _)| *k == "target_price"));
    }
}
