//! Redis pub/sub event bus.
//!
//! Publishing multiplexes over the shared connection manager; subscribing
//! opens a dedicated pub/sub connection per subscription and hands messages
//! to an mpsc channel so consumers get a plain stream of decoded payloads.

use crate::domain::errors::EngineError;
use anyhow::Context;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Clone)]
pub struct EventBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl EventBus {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to redis")?;
        Ok(Self { client, conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn publish<T: Serialize>(
        &self,
        channel: &str,
        event: &T,
    ) -> Result<(), EngineError> {
        let payload =
            serde_json::to_string(event).map_err(|e| EngineError::System(anyhow::Error::new(e)))?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Subscribes to a channel, decoding each message as `T`. Undecodable
    /// payloads are logged and skipped. The receiver closes if the pub/sub
    /// connection drops; workers treat that as a restart condition.
    pub async fn subscribe<T>(&self, channel: &str) -> anyhow::Result<mpsc::Receiver<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;

        let channel_name = channel.to_string();
        let (tx, rx) = mpsc::channel::<T>(256);

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Unreadable bus payload");
                        continue;
                    }
                };
                match serde_json::from_str::<T>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Skipping undecodable event");
                    }
                }
            }
            error!(channel = %channel_name, "Pub/sub stream ended");
        });

        Ok(rx)
    }
}
