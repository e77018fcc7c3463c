//! Audit worker: drains the transactional outbox onto the durable audit
//! queue and persists consumed audit events append-only.

use anyhow::Result;
use simbroker::application::audit_sink::AuditSink;
use simbroker::config::Config;
use simbroker::domain::events::AUDIT_QUEUE;
use simbroker::infrastructure::event_bus::EventBus;
use simbroker::infrastructure::outbox::OutboxPublisher;
use simbroker::infrastructure::persistence::database::Database;
use simbroker::infrastructure::persistence::ledger::Ledger;
use simbroker::infrastructure::trade_queue::DurableQueue;
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
    let consumer_name =
        std::env::var("WORKER_NAME").unwrap_or_else(|_| "audit-worker".to_string());
    let queue = DurableQueue::new(
        bus.connection(),
        AUDIT_QUEUE,
        &consumer_name,
        config.idempotency_ttl_secs,
    );
    queue.recover_stranded().await?;

    let publisher = OutboxPublisher::new(ledger.clone(), queue.clone());
    let sink = AuditSink::new(ledger, queue);

    info!("Audit worker started");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received; draining");
            let _ = shutdown_tx.send(true);
        }
    });

    tokio::join!(publisher.run(shutdown_rx.clone()), sink.run(shutdown_rx));

    info!("Audit worker stopped.");
    Ok(())
}
