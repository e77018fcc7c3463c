//! Durable FIFO over a Redis reliable list.
//!
//! Producers LPUSH onto the queue; each consumer BLMOVE's one message at a
//! time into its own processing list and LREM-acks it after the work
//! commits. Prefetch is one by construction, so a worker killed mid-message
//! leaves exactly one message parked in its processing list for recovery.

use crate::domain::errors::EngineError;
use anyhow::Context;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Clone)]
pub struct DurableQueue {
    conn: ConnectionManager,
    queue: String,
    processing: String,
    idempotency_ttl_secs: u64,
}

/// A message leased from the queue. Call [`DurableQueue::ack`] after the
/// side effects of handling it are committed.
#[derive(Debug, Clone)]
pub struct Leased<T> {
    pub body: T,
    raw: String,
}

impl DurableQueue {
    pub fn new(
        conn: ConnectionManager,
        queue: &str,
        consumer_name: &str,
        idempotency_ttl_secs: u64,
    ) -> Self {
        Self {
            conn,
            queue: queue.to_string(),
            processing: format!("{queue}:processing:{consumer_name}"),
            idempotency_ttl_secs,
        }
    }

    /// Publishes a message. With an idempotency key, a duplicate publish
    /// inside the retention window is dropped and reported as `false`.
    pub async fn publish<T: Serialize>(
        &self,
        message: &T,
        idempotency_key: Option<&str>,
    ) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();

        if let Some(key) = idempotency_key {
            let dedup_key = format!("{}:idem:{key}", self.queue);
            let fresh: Option<String> = redis::cmd("SET")
                .arg(&dedup_key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(self.idempotency_ttl_secs)
                .query_async(&mut conn)
                .await?;
            if fresh.is_none() {
                info!(queue = %self.queue, key, "Duplicate publish suppressed");
                return Ok(false);
            }
        }

        let payload =
            serde_json::to_string(message).map_err(|e| EngineError::System(anyhow::Error::new(e)))?;
        let _: () = conn.lpush(&self.queue, payload).await?;
        Ok(true)
    }

    /// Blocks up to `timeout_secs` for the next message, leasing it into the
    /// processing list. Returns None on timeout so callers can check for
    /// shutdown between leases.
    pub async fn lease<T: DeserializeOwned>(
        &self,
        timeout_secs: f64,
    ) -> Result<Option<Leased<T>>, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str::<T>(&raw) {
            Ok(body) => Ok(Some(Leased { body, raw })),
            Err(e) => {
                // Poison message: ack it away and surface the problem.
                warn!(queue = %self.queue, error = %e, "Dropping undecodable message");
                let _: () = conn.lrem(&self.processing, 1, &raw).await?;
                Err(EngineError::System(
                    anyhow::Error::new(e).context("undecodable queue message"),
                ))
            }
        }
    }

    pub async fn ack<T>(&self, leased: &Leased<T>) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(&self.processing, 1, &leased.raw).await?;
        Ok(())
    }

    /// Requeues messages a previous incarnation of this consumer left
    /// leased. Run once at startup before consuming.
    pub async fn recover_stranded(&self) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let mut recovered = 0u64;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .context("failed to recover stranded messages")?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            warn!(queue = %self.queue, recovered, "Requeued stranded in-flight messages");
        }
        Ok(recovered)
    }
}
