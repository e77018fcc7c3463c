//! Durable consumer of the audit queue.
//!
//! Persists wallet, portfolio, and order-status events append-only. A
//! message is acked only after its row is committed, so a crash mid-write
//! redelivers rather than drops.

use crate::domain::errors::EngineError;
use crate::domain::events::AuditEvent;
use crate::infrastructure::persistence::ledger::Ledger;
use crate::infrastructure::trade_queue::DurableQueue;
use tracing::{debug, info, warn};

pub struct AuditSink {
    ledger: Ledger,
    queue: DurableQueue,
}

impl AuditSink {
    pub fn new(ledger: Ledger, queue: DurableQueue) -> Self {
        Self { ledger, queue }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Audit sink consuming");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let leased = tokio::select! {
                leased = self.queue.lease::<AuditEvent>(1.0) => leased,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match leased {
                Ok(Some(leased)) => {
                    match self.persist(&leased.body).await {
                        Ok(()) => {
                            if let Err(e) = self.queue.ack(&leased).await {
                                warn!(error = %e, "Failed to ack audit message");
                            }
                        }
                        Err(e) => {
                            // Left leased; recovery requeues it on restart.
                            warn!(error = %e, "Failed to persist audit event");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Audit lease failed"),
            }
        }
        info!("Audit sink stopped");
    }

    /// Append-only insert for one audit event.
    pub async fn persist(&self, event: &AuditEvent) -> Result<(), EngineError> {
        match event {
            AuditEvent::WalletTx {
                user_id,
                wallet_id,
                prev_balance,
                new_balance,
                reason,
            } => {
                sqlx::query(
                    "INSERT INTO wallet_transaction_history \
                     (user_id, wallet_id, prev_balance, new_balance, reason) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(user_id)
                .bind(wallet_id)
                .bind(prev_balance)
                .bind(new_balance)
                .bind(reason)
                .execute(self.ledger.pool())
                .await?;
            }
            AuditEvent::PortfolioHistory {
                user_id,
                ticker_id,
                action,
                prev_quantity,
                new_quantity,
                prev_average_price,
                new_average_price,
                reason,
            } => {
                sqlx::query(
                    "INSERT INTO portfolio_history \
                     (user_id, ticker_id, action, prev_quantity, new_quantity, \
                      prev_average_price, new_average_price, reason) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(user_id)
                .bind(ticker_id)
                .bind(action.as_str())
                .bind(prev_quantity)
                .bind(new_quantity)
                .bind(prev_average_price)
                .bind(new_average_price)
                .bind(reason)
                .execute(self.ledger.pool())
                .await?;
            }
            AuditEvent::OrderStatus {
                order_id,
                user_id,
                prev_status,
                new_status,
                reason,
            } => {
                sqlx::query(
                    "INSERT INTO order_status_history \
                     (order_id, user_id, prev_status, new_status, reason) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(order_id)
                .bind(user_id)
                .bind(prev_status.map(|s| s.as_str()))
                .bind(new_status.as_str())
                .bind(reason.as_deref())
                .execute(self.ledger.pool())
                .await?;
            }
        }

        debug!("Audit event persisted");
        Ok(())
    }
}
