use crate::models::OrderStatus;
use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("marker cache write failed: {0}")]
    Write(String),
}

#[async_trait]
pub trait MarkerCache: Send + Sync {
    /// Whether an idempotency marker exists for the order. Reads fail
    /// open: an unreachable cache answers `false` and the durable store
    /// remains the source of truth.
    async fn get(&self, order_id: &str) -> bool;

    async fn put(&self, order_id: &str, status: OrderStatus) -> Result<(), CacheError>;
}

pub struct RedisMarkerCache {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisMarkerCache {
    pub fn new(client: redis::Client) -> Self {
        let ttl_secs = std::env::var("MARKER_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(36_000);
        Self { client, ttl_secs }
    }

    fn key(order_id: &str) -> String {
        format!("order:{order_id}")
    }
}

#[async_trait]
impl MarkerCache for RedisMarkerCache {
    async fn get(&self, order_id: &str) -> bool {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    target = "stocksync.cache",
                    order_id = order_id,
                    error = %err,
                    "marker cache unreachable, treating order as unseen"
                );
                return false;
            }
        };
        match conn.get::<_, Option<String>>(Self::key(order_id)).await {
            Ok(marker) => marker.is_some(),
            Err(err) => {
                warn!(
                    target = "stocksync.cache",
                    order_id = order_id,
                    error = %err,
                    "marker lookup failed, treating order as unseen"
                );
                false
            }
        }
    }

    async fn put(&self, order_id: &str, status: OrderStatus) -> Result<(), CacheError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CacheError::Write(err.to_string()))?;
        conn.set_ex::<_, _, ()>(Self::key(order_id), status.as_str(), self.ttl_secs)
            .await
            .map_err(|err| CacheError::Write(err.to_string()))
    }
}
