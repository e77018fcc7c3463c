//! Outbox drain: moves audit events staged by ledger transactions onto the
//! durable audit queue. Runs in the audit worker alongside the sink.
//!
//! Rows are claimed with FOR UPDATE SKIP LOCKED so several drains can run
//! concurrently without double-publishing; a row is marked published only
//! after the queue push succeeds, giving at-least-once delivery.

use crate::domain::errors::EngineError;
use crate::domain::events::AuditEvent;
use crate::infrastructure::persistence::ledger::Ledger;
use crate::infrastructure::trade_queue::DurableQueue;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, error};

pub struct OutboxPublisher {
    ledger: Ledger,
    audit_queue: DurableQueue,
    batch_size: i64,
    poll_interval: Duration,
}

impl OutboxPublisher {
    pub fn new(ledger: Ledger, audit_queue: DurableQueue) -> Self {
        Self {
            ledger,
            audit_queue,
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Drains until cancelled. Errors back off briefly instead of exiting;
    /// the outbox is the audit trail's source of truth and must keep moving.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain_batch().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(published) => debug!(published, "Outbox batch published"),
                Err(e) => {
                    error!(error = %e, "Outbox drain failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Publishes one claimed batch. Returns the number of rows published.
    pub async fn drain_batch(&self) -> Result<usize, EngineError> {
        let mut tx = self.ledger.pool().begin().await?;

        let rows = sqlx::query(
            "SELECT id, payload FROM outbox WHERE published_at IS NULL \
             ORDER BY id ASC LIMIT $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut published_ids: Vec<i64> = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.get("id");
            let payload: serde_json::Value = row.get("payload");

            let event: AuditEvent = serde_json::from_value(payload)
                .map_err(|e| EngineError::System(anyhow::Error::new(e)))?;
            self.audit_queue.publish(&event, None).await?;
            published_ids.push(id);
        }

        sqlx::query("UPDATE outbox SET published_at = NOW() WHERE id = ANY($1)")
            .bind(&published_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(published_ids.len())
    }
}
