//! Transactional ledger over Postgres.
//!
//! All settlement state (wallets, portfolios, orders) mutates through a
//! [`LedgerTx`]. The write helpers couple every wallet and portfolio
//! mutation to its audit event, staged into the transactional outbox so a
//! rollback discards state and events together.
//!
//! Lock discipline: wallet rows first (ascending user id when two are
//! involved), then portfolio rows in ticker order, then order rows.

use crate::domain::asset::{Position, Ticker, User, Wallet};
use crate::domain::errors::EngineError;
use crate::domain::events::{AuditEvent, PortfolioAction};
use crate::domain::order::Order;
use crate::domain::types::{is_dust, Currency, MarketType, OrderSide, OrderStatus, OrderType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use super::database::Database;

fn parse_enum<T>(value: &str) -> Result<T, EngineError>
where
    T: FromStr<Err = String>,
{
    T::from_str(value).map_err(|e| EngineError::System(anyhow::anyhow!(e)))
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    ticker_id: String,
    side: String,
    order_type: String,
    status: String,
    quantity: Decimal,
    unfilled_quantity: Decimal,
    target_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    trailing_gap: Option<Decimal>,
    high_water_mark: Option<Decimal>,
    price: Option<Decimal>,
    fee: Decimal,
    realized_pnl: Option<Decimal>,
    applied_exchange_rate: Decimal,
    fail_reason: Option<String>,
    created_at: DateTime<Utc>,
    filled_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for Order {
    type Error = EngineError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            ticker_id: row.ticker_id,
            side: parse_enum::<OrderSide>(&row.side)?,
            order_type: parse_enum::<OrderType>(&row.order_type)?,
            status: parse_enum::<OrderStatus>(&row.status)?,
            quantity: row.quantity,
            unfilled_quantity: row.unfilled_quantity,
            target_price: row.target_price,
            stop_price: row.stop_price,
            trailing_gap: row.trailing_gap,
            high_water_mark: row.high_water_mark,
            price: row.price,
            fee: row.fee,
            realized_pnl: row.realized_pnl,
            applied_exchange_rate: row.applied_exchange_rate,
            fail_reason: row.fail_reason,
            created_at: row.created_at,
            filled_at: row.filled_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

const ORDER_COLUMNS: &str = "id, user_id, ticker_id, side, order_type, status, quantity, \
     unfilled_quantity, target_price, stop_price, trailing_gap, high_water_mark, price, fee, \
     realized_pnl, applied_exchange_rate, fail_reason, created_at, filled_at, cancelled_at";

/// Shared, cloneable handle to the ledger store.
#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    pub async fn begin(&self) -> Result<LedgerTx, EngineError> {
        let tx = self.db.pool.begin().await?;
        Ok(LedgerTx { tx })
    }

    // ---- lock-free snapshot reads ----

    pub async fn order(&self, order_id: Uuid) -> Result<Option<Order>, EngineError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    pub async fn wallet_of(&self, user_id: Uuid) -> Result<Option<Wallet>, EngineError> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, Decimal)>(
            "SELECT id, user_id, balance FROM wallets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(row.map(|(id, user_id, balance)| Wallet {
            id,
            user_id,
            balance,
        }))
    }

    pub async fn position_of(
        &self,
        user_id: Uuid,
        ticker_id: &str,
    ) -> Result<Option<Position>, EngineError> {
        let row = sqlx::query_as::<_, (Decimal, Decimal)>(
            "SELECT quantity, average_price FROM portfolios \
             WHERE user_id = $1 AND ticker_id = $2",
        )
        .bind(user_id)
        .bind(ticker_id)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(row.map(|(quantity, average_price)| Position {
            user_id,
            ticker_id: ticker_id.to_string(),
            quantity,
            average_price,
        }))
    }

    pub async fn positions_of(&self, user_id: Uuid) -> Result<Vec<Position>, EngineError> {
        let rows = sqlx::query_as::<_, (String, Decimal, Decimal)>(
            "SELECT ticker_id, quantity, average_price FROM portfolios \
             WHERE user_id = $1 ORDER BY ticker_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ticker_id, quantity, average_price)| Position {
                user_id,
                ticker_id,
                quantity,
                average_price,
            })
            .collect())
    }

    /// PENDING conditionals of one ticker, oldest first. Used for cache
    /// hydration.
    pub async fn pending_conditionals(&self, ticker_id: &str) -> Result<Vec<Order>, EngineError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ticker_id = $1 AND status = 'PENDING' AND order_type <> 'MARKET' \
             ORDER BY created_at ASC"
        ))
        .bind(ticker_id)
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    /// All PENDING orders of one ticker, oldest first. The P2P matcher feeds
    /// these to its planner.
    pub async fn pending_orders(&self, ticker_id: &str) -> Result<Vec<Order>, EngineError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ticker_id = $1 AND status = 'PENDING' \
             ORDER BY created_at ASC"
        ))
        .bind(ticker_id)
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    pub async fn pending_trailing_stops(&self, ticker_id: &str) -> Result<Vec<Order>, EngineError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ticker_id = $1 AND status = 'PENDING' AND order_type = 'TRAILING_STOP' \
             ORDER BY created_at ASC"
        ))
        .bind(ticker_id)
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    pub async fn active_human_tickers(&self) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT id FROM tickers WHERE market_type = 'HUMAN' AND is_active = TRUE",
        )
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Users currently short the given ticker.
    pub async fn short_holders(&self, ticker_id: &str) -> Result<Vec<Uuid>, EngineError> {
        let rows = sqlx::query_as::<_, (Uuid,)>(
            "SELECT DISTINCT user_id FROM portfolios WHERE ticker_id = $1 AND quantity < 0",
        )
        .bind(ticker_id)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

}

/// One open ledger transaction. Dropped without [`commit`](Self::commit),
/// everything rolls back, staged outbox events included.
pub struct LedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl LedgerTx {
    pub async fn commit(self) -> Result<(), EngineError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), EngineError> {
        self.tx.rollback().await?;
        Ok(())
    }

    // ---- reads ----

    pub async fn ticker(&mut self, ticker_id: &str) -> Result<Option<Ticker>, EngineError> {
        let row = sqlx::query_as::<_, (String, String, String, String, String, bool)>(
            "SELECT id, symbol, name, market_type, currency, is_active \
             FROM tickers WHERE id = $1",
        )
        .bind(ticker_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|(id, symbol, name, market_type, currency, is_active)| {
            Ok(Ticker {
                id,
                symbol,
                name,
                market_type: parse_enum::<MarketType>(&market_type)?,
                currency: parse_enum::<Currency>(&currency)?,
                is_active,
            })
        })
        .transpose()
    }

    pub async fn user(&mut self, user_id: Uuid) -> Result<Option<User>, EngineError> {
        let row = sqlx::query_as::<_, (Uuid, bool, bool, i32, Decimal)>(
            "SELECT id, is_active, is_bankrupt, bankruptcy_count, dividend_rate \
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(
            |(id, is_active, is_bankrupt, bankruptcy_count, dividend_rate)| User {
                id,
                is_active,
                is_bankrupt,
                bankruptcy_count,
                dividend_rate,
            },
        ))
    }

    /// Lock-free order read inside this transaction, used to discover the
    /// parties of a planned match before taking locks in canonical order.
    pub async fn order(&mut self, order_id: Uuid) -> Result<Option<Order>, EngineError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Order::try_from).transpose()
    }

    // ---- row locks ----

    pub async fn lock_wallet(&mut self, user_id: Uuid) -> Result<Option<Wallet>, EngineError> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, Decimal)>(
            "SELECT id, user_id, balance FROM wallets WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|(id, user_id, balance)| Wallet {
            id,
            user_id,
            balance,
        }))
    }

    /// Existing position under lock, or a zero position when the row does
    /// not exist yet. The bool reports whether a row was found.
    pub async fn lock_position(
        &mut self,
        user_id: Uuid,
        ticker_id: &str,
    ) -> Result<(Position, bool), EngineError> {
        let row = sqlx::query_as::<_, (Decimal, Decimal)>(
            "SELECT quantity, average_price FROM portfolios \
             WHERE user_id = $1 AND ticker_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(ticker_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some((quantity, average_price)) => Ok((
                Position {
                    user_id,
                    ticker_id: ticker_id.to_string(),
                    quantity,
                    average_price,
                },
                true,
            )),
            None => Ok((Position::empty(user_id, ticker_id), false)),
        }
    }

    /// Locks every position row of a user, ticker ascending.
    pub async fn lock_positions_of(&mut self, user_id: Uuid) -> Result<Vec<Position>, EngineError> {
        let rows = sqlx::query_as::<_, (String, Decimal, Decimal)>(
            "SELECT ticker_id, quantity, average_price FROM portfolios \
             WHERE user_id = $1 ORDER BY ticker_id ASC FOR UPDATE",
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ticker_id, quantity, average_price)| Position {
                user_id,
                ticker_id,
                quantity,
                average_price,
            })
            .collect())
    }

    /// Shareholders of a Human-ETF ticker, excluding the issuer. Read inside
    /// the settlement transaction so payouts see a consistent cap table.
    pub async fn shareholders(
        &mut self,
        ticker_id: &str,
        exclude_user: Uuid,
    ) -> Result<Vec<Position>, EngineError> {
        let rows = sqlx::query_as::<_, (Uuid, Decimal, Decimal)>(
            "SELECT user_id, quantity, average_price FROM portfolios \
             WHERE ticker_id = $1 AND user_id <> $2 AND quantity > 0 \
             ORDER BY user_id ASC",
        )
        .bind(ticker_id)
        .bind(exclude_user)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, quantity, average_price)| Position {
                user_id,
                ticker_id: ticker_id.to_string(),
                quantity,
                average_price,
            })
            .collect())
    }

    pub async fn lock_order(&mut self, order_id: Uuid) -> Result<Option<Order>, EngineError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Order::try_from).transpose()
    }

    // ---- audited writes ----

    /// Stages an audit event into the outbox, same transaction.
    pub async fn stage_audit(&mut self, event: &AuditEvent) -> Result<(), EngineError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EngineError::System(anyhow::Error::new(e)))?;
        sqlx::query("INSERT INTO outbox (payload) VALUES ($1)")
            .bind(payload)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Sets a wallet balance and stages the matching wallet_tx audit row.
    pub async fn set_wallet_balance(
        &mut self,
        wallet: &Wallet,
        new_balance: Decimal,
        reason: &str,
    ) -> Result<Wallet, EngineError> {
        sqlx::query("UPDATE wallets SET balance = $1 WHERE id = $2")
            .bind(new_balance)
            .bind(wallet.id)
            .execute(&mut *self.tx)
            .await?;

        self.stage_audit(&AuditEvent::WalletTx {
            user_id: wallet.user_id,
            wallet_id: wallet.id,
            prev_balance: wallet.balance,
            new_balance,
            reason: reason.to_string(),
        })
        .await?;

        Ok(Wallet {
            id: wallet.id,
            user_id: wallet.user_id,
            balance: new_balance,
        })
    }

    /// Applies a position image: inserts, updates, or (for dust) deletes the
    /// row, staging the matching portfolio_history event.
    pub async fn write_position(
        &mut self,
        prev: &Position,
        row_exists: bool,
        new_quantity: Decimal,
        new_average_price: Decimal,
        reason: &str,
    ) -> Result<(), EngineError> {
        if is_dust(new_quantity) {
            if !row_exists {
                return Ok(());
            }
            sqlx::query("DELETE FROM portfolios WHERE user_id = $1 AND ticker_id = $2")
                .bind(prev.user_id)
                .bind(&prev.ticker_id)
                .execute(&mut *self.tx)
                .await?;

            return self
                .stage_audit(&AuditEvent::PortfolioHistory {
                    user_id: prev.user_id,
                    ticker_id: prev.ticker_id.clone(),
                    action: PortfolioAction::Delete,
                    prev_quantity: Some(prev.quantity),
                    new_quantity: None,
                    prev_average_price: Some(prev.average_price),
                    new_average_price: None,
                    reason: reason.to_string(),
                })
                .await;
        }

        if row_exists {
            sqlx::query(
                "UPDATE portfolios SET quantity = $1, average_price = $2 \
                 WHERE user_id = $3 AND ticker_id = $4",
            )
            .bind(new_quantity)
            .bind(new_average_price)
            .bind(prev.user_id)
            .bind(&prev.ticker_id)
            .execute(&mut *self.tx)
            .await?;

            self.stage_audit(&AuditEvent::PortfolioHistory {
                user_id: prev.user_id,
                ticker_id: prev.ticker_id.clone(),
                action: PortfolioAction::Update,
                prev_quantity: Some(prev.quantity),
                new_quantity: Some(new_quantity),
                prev_average_price: Some(prev.average_price),
                new_average_price: Some(new_average_price),
                reason: reason.to_string(),
            })
            .await
        } else {
            sqlx::query(
                "INSERT INTO portfolios (user_id, ticker_id, quantity, average_price) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(prev.user_id)
            .bind(&prev.ticker_id)
            .bind(new_quantity)
            .bind(new_average_price)
            .execute(&mut *self.tx)
            .await?;

            self.stage_audit(&AuditEvent::PortfolioHistory {
                user_id: prev.user_id,
                ticker_id: prev.ticker_id.clone(),
                action: PortfolioAction::Insert,
                prev_quantity: None,
                new_quantity: Some(new_quantity),
                prev_average_price: None,
                new_average_price: Some(new_average_price),
                reason: reason.to_string(),
            })
            .await
        }
    }

    pub async fn insert_order(&mut self, order: &Order) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO orders (id, user_id, ticker_id, side, order_type, status, quantity, \
             unfilled_quantity, target_price, stop_price, trailing_gap, high_water_mark, price, \
             fee, realized_pnl, applied_exchange_rate, fail_reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(&order.ticker_id)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .bind(order.quantity)
        .bind(order.unfilled_quantity)
        .bind(order.target_price)
        .bind(order.stop_price)
        .bind(order.trailing_gap)
        .bind(order.high_water_mark)
        .bind(order.price)
        .bind(order.fee)
        .bind(order.realized_pnl)
        .bind(order.applied_exchange_rate)
        .bind(order.fail_reason.as_deref())
        .bind(order.created_at)
        .execute(&mut *self.tx)
        .await?;

        self.stage_audit(&AuditEvent::OrderStatus {
            order_id: order.id,
            user_id: order.user_id,
            prev_status: None,
            new_status: order.status,
            reason: None,
        })
        .await
    }

    async fn record_status_change(
        &mut self,
        order: &Order,
        new_status: OrderStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.stage_audit(&AuditEvent::OrderStatus {
            order_id: order.id,
            user_id: order.user_id,
            prev_status: Some(order.status),
            new_status,
            reason,
        })
        .await
    }

    pub async fn mark_order_filled(
        &mut self,
        order: &Order,
        price: Decimal,
        fee: Decimal,
        realized_pnl: Option<Decimal>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE orders SET status = 'FILLED', unfilled_quantity = 0, price = $1, fee = $2, \
             realized_pnl = $3, filled_at = NOW() WHERE id = $4",
        )
        .bind(price)
        .bind(fee)
        .bind(realized_pnl)
        .bind(order.id)
        .execute(&mut *self.tx)
        .await?;

        self.record_status_change(order, OrderStatus::Filled, None)
            .await
    }

    pub async fn mark_order_failed(
        &mut self,
        order: &Order,
        reason: &str,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE orders SET status = 'FAILED', fail_reason = $1 WHERE id = $2")
            .bind(reason)
            .bind(order.id)
            .execute(&mut *self.tx)
            .await?;

        self.record_status_change(order, OrderStatus::Failed, Some(reason.to_string()))
            .await
    }

    pub async fn mark_order_cancelled(
        &mut self,
        order: &Order,
        reason: &str,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE orders SET status = 'CANCELLED', fail_reason = $1, cancelled_at = NOW() \
             WHERE id = $2",
        )
        .bind(reason)
        .bind(order.id)
        .execute(&mut *self.tx)
        .await?;

        self.record_status_change(order, OrderStatus::Cancelled, Some(reason.to_string()))
            .await
    }

    /// STOP_LIMIT promotion: the order becomes a resting LIMIT at its target
    /// price and stays PENDING for the next tick.
    pub async fn promote_stop_limit(&mut self, order: &Order) -> Result<(), EngineError> {
        sqlx::query("UPDATE orders SET order_type = 'LIMIT' WHERE id = $1")
            .bind(order.id)
            .execute(&mut *self.tx)
            .await?;

        self.stage_audit(&AuditEvent::OrderStatus {
            order_id: order.id,
            user_id: order.user_id,
            prev_status: Some(order.status),
            new_status: OrderStatus::Triggered,
            reason: Some("stop-limit promoted to limit".to_string()),
        })
        .await
    }

    pub async fn update_trailing_stop(
        &mut self,
        order: &Order,
        stop_price: Decimal,
        high_water_mark: Decimal,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE orders SET stop_price = $1, high_water_mark = $2 WHERE id = $3")
            .bind(stop_price)
            .bind(high_water_mark)
            .bind(order.id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Partial-fill bookkeeping for P2P settlement. Transitions to FILLED
    /// when nothing is left unfilled.
    pub async fn apply_p2p_fill(
        &mut self,
        order: &Order,
        fill_quantity: Decimal,
        fill_price: Decimal,
        fee: Decimal,
        realized_pnl: Option<Decimal>,
    ) -> Result<OrderStatus, EngineError> {
        let remaining = order.unfilled_quantity - fill_quantity;
        let filled = remaining <= Decimal::ZERO;

        // PnL accumulates across partial fills of one order.
        let total_pnl = match (order.realized_pnl, realized_pnl) {
            (None, None) => None,
            (prev, cur) => Some(prev.unwrap_or(Decimal::ZERO) + cur.unwrap_or(Decimal::ZERO)),
        };

        if filled {
            sqlx::query(
                "UPDATE orders SET status = 'FILLED', unfilled_quantity = 0, price = $1, \
                 fee = fee + $2, realized_pnl = $3, filled_at = NOW() WHERE id = $4",
            )
            .bind(fill_price)
            .bind(fee)
            .bind(total_pnl)
            .bind(order.id)
            .execute(&mut *self.tx)
            .await?;

            self.record_status_change(order, OrderStatus::Filled, None)
                .await?;
            Ok(OrderStatus::Filled)
        } else {
            sqlx::query(
                "UPDATE orders SET unfilled_quantity = $1, price = $2, fee = fee + $3, \
                 realized_pnl = $4 WHERE id = $5",
            )
            .bind(remaining)
            .bind(fill_price)
            .bind(fee)
            .bind(total_pnl)
            .bind(order.id)
            .execute(&mut *self.tx)
            .await?;
            Ok(OrderStatus::Pending)
        }
    }

    /// Upserts an ACCEPTED-as-PENDING order row for Human-ETF market orders
    /// handed off to the P2P matcher. Stop-family orders that triggered
    /// become MARKET so the matcher can cross them.
    pub async fn upsert_human_order(
        &mut self,
        order_id: Uuid,
        user_id: Uuid,
        ticker_id: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<(), EngineError> {
        let existing = self.lock_order(order_id).await?;

        match existing {
            Some(order) => {
                if order.order_type.is_stop_family() {
                    sqlx::query(
                        "UPDATE orders SET order_type = 'MARKET', status = 'PENDING' WHERE id = $1",
                    )
                    .bind(order.id)
                    .execute(&mut *self.tx)
                    .await?;

                    self.stage_audit(&AuditEvent::OrderStatus {
                        order_id: order.id,
                        user_id: order.user_id,
                        prev_status: Some(order.status),
                        new_status: OrderStatus::Pending,
                        reason: Some("stop order triggered, awaiting p2p match".to_string()),
                    })
                    .await?;
                }
                Ok(())
            }
            None => {
                let order = Order {
                    id: order_id,
                    user_id,
                    ticker_id: ticker_id.to_string(),
                    side,
                    order_type: OrderType::Market,
                    status: OrderStatus::Pending,
                    quantity,
                    unfilled_quantity: quantity,
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
                self.insert_order(&order).await
            }
        }
    }

    /// OHLCV upsert keyed (ticker, bucket, interval): open keeps the first
    /// trade, high/low widen, close follows, volume accumulates.
    pub async fn upsert_candle(
        &mut self,
        ticker_id: &str,
        interval: &str,
        bucket_start: DateTime<Utc>,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO candles (ticker_id, interval, bucket_start, open, high, low, close, volume) \
             VALUES ($1, $2, $3, $4, $4, $4, $4, $5) \
             ON CONFLICT (ticker_id, bucket_start, interval) DO UPDATE SET \
             high = GREATEST(candles.high, EXCLUDED.high), \
             low = LEAST(candles.low, EXCLUDED.low), \
             close = EXCLUDED.close, \
             volume = candles.volume + EXCLUDED.volume",
        )
        .bind(ticker_id)
        .bind(interval)
        .bind(bucket_start)
        .bind(price)
        .bind(quantity)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn record_dividend(
        &mut self,
        payer_id: Uuid,
        receiver_id: Uuid,
        ticker_id: &str,
        amount: Decimal,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO dividend_history (payer_id, receiver_id, ticker_id, amount) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(payer_id)
        .bind(receiver_id)
        .bind(ticker_id)
        .bind(amount)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}
