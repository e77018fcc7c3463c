use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Shared Postgres handle. Cloning is cheap; the pool is reference-counted.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;

        info!("Connected to database");

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Bootstrap the engine schema. Idempotent; production migrations are a
    /// deployment concern, this keeps local and test environments usable.
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                is_bankrupt BOOLEAN NOT NULL DEFAULT FALSE,
                bankruptcy_count INTEGER NOT NULL DEFAULT 0,
                dividend_rate NUMERIC(5, 4) NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tickers (
                id VARCHAR(50) PRIMARY KEY,
                symbol VARCHAR(50) NOT NULL,
                name VARCHAR(100) NOT NULL,
                market_type VARCHAR(10) NOT NULL,
                currency VARCHAR(5) NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create tickers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL UNIQUE REFERENCES users(id),
                balance NUMERIC(20, 8) NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create wallets table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolios (
                user_id UUID NOT NULL REFERENCES users(id),
                ticker_id VARCHAR(50) NOT NULL REFERENCES tickers(id),
                quantity NUMERIC(20, 8) NOT NULL DEFAULT 0,
                average_price NUMERIC(20, 8) NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, ticker_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create portfolios table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_portfolios_ticker_short
            ON portfolios (ticker_id) WHERE quantity < 0;
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create portfolio short index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL REFERENCES users(id),
                ticker_id VARCHAR(50) NOT NULL REFERENCES tickers(id),
                side VARCHAR(4) NOT NULL,
                order_type VARCHAR(15) NOT NULL,
                status VARCHAR(10) NOT NULL,
                quantity NUMERIC(20, 8) NOT NULL,
                unfilled_quantity NUMERIC(20, 8) NOT NULL,
                target_price NUMERIC(20, 8),
                stop_price NUMERIC(20, 8),
                trailing_gap NUMERIC(20, 8),
                high_water_mark NUMERIC(20, 8),
                price NUMERIC(20, 8),
                fee NUMERIC(20, 8) NOT NULL DEFAULT 0,
                realized_pnl NUMERIC(20, 8),
                applied_exchange_rate NUMERIC(10, 2) NOT NULL DEFAULT 1,
                fail_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                filled_at TIMESTAMPTZ,
                cancelled_at TIMESTAMPTZ
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_pending_ticker
            ON orders (ticker_id, created_at) WHERE status = 'PENDING';
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create pending order index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                ticker_id VARCHAR(50) NOT NULL REFERENCES tickers(id),
                interval VARCHAR(5) NOT NULL,
                bucket_start TIMESTAMPTZ NOT NULL,
                open NUMERIC(20, 8) NOT NULL,
                high NUMERIC(20, 8) NOT NULL,
                low NUMERIC(20, 8) NOT NULL,
                close NUMERIC(20, 8) NOT NULL,
                volume NUMERIC(20, 8) NOT NULL DEFAULT 0,
                PRIMARY KEY (ticker_id, bucket_start, interval)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create candles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BIGSERIAL PRIMARY KEY,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                published_at TIMESTAMPTZ
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create outbox table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_unpublished
            ON outbox (id) WHERE published_at IS NULL;
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create outbox index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_transaction_history (
                id BIGSERIAL PRIMARY KEY,
                user_id UUID NOT NULL,
                wallet_id UUID NOT NULL,
                prev_balance NUMERIC(20, 8) NOT NULL,
                new_balance NUMERIC(20, 8) NOT NULL,
                reason VARCHAR(100),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create wallet_transaction_history table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_history (
                id BIGSERIAL PRIMARY KEY,
                user_id UUID NOT NULL,
                ticker_id VARCHAR(50) NOT NULL,
                action VARCHAR(20) NOT NULL,
                prev_quantity NUMERIC(20, 8),
                new_quantity NUMERIC(20, 8),
                prev_average_price NUMERIC(20, 8),
                new_average_price NUMERIC(20, 8),
                reason VARCHAR(200),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create portfolio_history table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_status_history (
                id BIGSERIAL PRIMARY KEY,
                order_id UUID NOT NULL,
                user_id UUID NOT NULL,
                prev_status VARCHAR(10),
                new_status VARCHAR(10) NOT NULL,
                reason VARCHAR(200),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create order_status_history table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dividend_history (
                id BIGSERIAL PRIMARY KEY,
                payer_id UUID NOT NULL,
                receiver_id UUID NOT NULL,
                ticker_id VARCHAR(50) NOT NULL,
                amount NUMERIC(20, 8) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create dividend_history table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
