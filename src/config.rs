use anyhow::{Context, Result};
use std::env;

/// Engine configuration, read once from the environment at worker startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_host: String,
    pub redis_port: u16,
    /// Seconds between Human-ETF matching sweeps.
    pub human_match_interval_secs: u64,
    /// TTL of the cache-hydration lock in milliseconds.
    pub cache_lock_ttl_ms: u64,
    /// Retention of queue idempotency keys in seconds.
    pub idempotency_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is not set")?;

        let redis_host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let redis_port = env::var("REDIS_PORT")
            .unwrap_or_else(|_| "6379".to_string())
            .parse::<u16>()
            .context("REDIS_PORT must be a port number")?;

        let human_match_interval_secs = env::var("HUMAN_MATCH_INTERVAL_SECS")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<u64>()
            .context("HUMAN_MATCH_INTERVAL_SECS must be an integer")?;

        let cache_lock_ttl_ms = env::var("CACHE_LOCK_TTL_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u64>()
            .context("CACHE_LOCK_TTL_MS must be an integer")?;

        let idempotency_ttl_secs = env::var("IDEMPOTENCY_TTL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse::<u64>()
            .context("IDEMPOTENCY_TTL_SECS must be an integer")?;

        Ok(Self {
            database_url,
            redis_host,
            redis_port,
            human_match_interval_secs,
            cache_lock_ttl_ms,
            idempotency_ttl_secs,
        })
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_formatting() {
        let config = Config {
            database_url: "postgres://localhost/simbroker".to_string(),
            redis_host: "cache.internal".to_string(),
            redis_port: 6380,
            human_match_interval_secs: 1,
            cache_lock_ttl_ms: 5000,
            idempotency_ttl_secs: 86400,
        };
        assert_eq!(config.redis_url(), "redis://cache.internal:6380");
    }
}
