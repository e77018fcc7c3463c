//! Conditional matcher worker: reacts to price ticks by triggering resting
//! limit/stop orders, and consumes order lifecycle events to keep the hot
//! cache aligned with the ledger.

use anyhow::Result;
use simbroker::application::conditional::ConditionalMatcher;
use simbroker::application::executor::TradeExecutor;
use simbroker::config::Config;
use simbroker::domain::events::{PriceUpdate, TradeEvent, CHANNEL_PRICE_UPDATES, CHANNEL_TRADE_EVENTS};
use simbroker::infrastructure::event_bus::EventBus;
use simbroker::infrastructure::order_cache::OrderBookCache;
use simbroker::infrastructure::persistence::database::Database;
use simbroker::infrastructure::persistence::ledger::Ledger;
use simbroker::infrastructure::price_store::PriceStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let db = Database::connect(&config.database_url).await?;
    let ledger = Ledger::new(db);

    let bus = EventBus::connect(&config.redis_url()).await?;
    let prices = PriceStore::from_connection(bus.connection());
    let cache = OrderBookCache::new(bus.connection(), ledger.clone(), config.cache_lock_ttl_ms);
    let executor = TradeExecutor::new(ledger.clone(), prices, bus.clone());

    let ticks = bus.subscribe::<PriceUpdate>(CHANNEL_PRICE_UPDATES).await?;
    let order_events = bus.subscribe::<TradeEvent>(CHANNEL_TRADE_EVENTS).await?;

    let matcher = ConditionalMatcher::new(ledger, cache, executor);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    matcher.run(ticks, order_events, shutdown_rx).await;

    info!("Conditional matcher stopped.");
    Ok(())
}
