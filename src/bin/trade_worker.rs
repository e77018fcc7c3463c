//! Trade worker: consumes the durable trade queue and settles market orders
//! through the ledger.
//!
//! Messages are leased one at a time and acked only after execution, so a
//! shutdown mid-order never strands work: the in-flight message finishes,
//! and anything left leased by a crash is requeued on the next start.

use anyhow::Result;
use simbroker::application::executor::TradeExecutor;
use simbroker::config::Config;
use simbroker::domain::events::TRADE_QUEUE;
use simbroker::domain::order::TradeInstruction;
use simbroker::infrastructure::event_bus::EventBus;
use simbroker::infrastructure::persistence::database::Database;
use simbroker::infrastructure::persistence::ledger::Ledger;
use simbroker::infrastructure::price_store::PriceStore;
use simbroker::infrastructure::trade_queue::DurableQueue;
use tracing::{error, info, warn};
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
    let consumer_name =
        std::env::var("WORKER_NAME").unwrap_or_else(|_| "trade-worker".to_string());
    let queue = DurableQueue::new(
        bus.connection(),
        TRADE_QUEUE,
        &consumer_name,
        config.idempotency_ttl_secs,
    );
    queue.recover_stranded().await?;

    let executor = TradeExecutor::new(ledger, prices, bus);

    info!("Trade worker started; waiting for orders");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received; draining");
            let _ = shutdown_tx.send(true);
        }
    });

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match queue.lease::<TradeInstruction>(1.0).await {
            Ok(Some(leased)) => {
                info!(order_id = %leased.body.order_id, "Processing order");
                match executor.execute_trade(&leased.body, None).await {
                    Ok(outcome) => info!(order_id = %leased.body.order_id, ?outcome, "Order processed"),
                    Err(e) => error!(order_id = %leased.body.order_id, error = %e, "Order processing failed"),
                }
                // Ack regardless: the outcome (including FAILED) is recorded
                // in the ledger; redelivery would not improve on it.
                if let Err(e) = queue.ack(&leased).await {
                    warn!(error = %e, "Failed to ack trade message");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Queue lease failed; backing off");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    info!("Trade worker stopped.");
    Ok(())
}
