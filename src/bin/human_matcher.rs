//! Human-ETF matcher worker: periodic P2P matching sweep over all HUMAN
//! tickers with price-time priority settlement.

use anyhow::Result;
use simbroker::application::executor::TradeExecutor;
use simbroker::application::human_matcher::HumanMatcher;
use simbroker::config::Config;
use simbroker::infrastructure::event_bus::EventBus;
use simbroker::infrastructure::persistence::database::Database;
use simbroker::infrastructure::persistence::ledger::Ledger;
use simbroker::infrastructure::price_store::PriceStore;
use std::time::Duration;
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
    let executor = TradeExecutor::new(ledger.clone(), prices.clone(), bus);

    let matcher = HumanMatcher::new(
        ledger,
        executor,
        prices,
        Duration::from_secs(config.human_match_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    matcher.run(shutdown_rx).await;

    info!("Human matcher stopped.");
    Ok(())
}
