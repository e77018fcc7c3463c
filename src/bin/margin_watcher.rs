//! Margin watcher worker: subscribes to price updates and force-liquidates
//! short holders whose equity falls below maintenance.

use anyhow::Result;
use simbroker::application::margin_watcher::MarginWatcher;
use simbroker::config::Config;
use simbroker::domain::events::{PriceUpdate, CHANNEL_PRICE_UPDATES};
use simbroker::infrastructure::event_bus::EventBus;
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

    let ticks = bus.subscribe::<PriceUpdate>(CHANNEL_PRICE_UPDATES).await?;
    let watcher = MarginWatcher::new(ledger, prices, bus);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    watcher.run(ticks, shutdown_rx).await;

    info!("Margin watcher stopped.");
    Ok(())
}
