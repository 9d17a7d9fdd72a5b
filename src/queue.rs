use crate::models::OrderNotification;
use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Backend(String),
    #[error("message could not be encoded: {0}")]
    Encode(String),
}

/// Opaque token required to delete a message after processing. Valid for
/// the current delivery only and never persisted.
#[derive(Debug, Clone)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub account_id: String,
    pub order_id: String,
    pub attempts: u32,
    pub receipt: ReceiptHandle,
}

#[async_trait]
pub trait OrderQueue: Send + Sync {
    async fn publish(&self, notification: &OrderNotification) -> Result<(), QueueError>;

    /// Next batch of deliveries. Backend trouble yields an empty batch so
    /// the poll loop keeps running; redelivery covers anything missed.
    async fn receive(&self) -> Vec<QueuedMessage>;

    /// Idempotent delete. Acknowledging an unknown or expired handle is
    /// not an error.
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

/// Redis list pair: `LPUSH` onto pending, `LMOVE` pending->in-flight on
/// receive, `LREM` from in-flight on acknowledge. The receipt handle is
/// the raw in-flight payload.
pub struct RedisOrderQueue {
    client: redis::Client,
    pending: String,
    inflight: String,
    batch_size: usize,
}

impl RedisOrderQueue {
    pub fn new(client: redis::Client) -> Self {
        let batch_size = std::env::var("ORDER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(10);
        Self {
            client,
            pending: "orders:pending".to_string(),
            inflight: "orders:inflight".to_string(),
            batch_size,
        }
    }
}

#[async_trait]
impl OrderQueue for RedisOrderQueue {
    async fn publish(&self, notification: &OrderNotification) -> Result<(), QueueError> {
        let payload = serde_json::to_string(notification)
            .map_err(|err| QueueError::Encode(err.to_string()))?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        let _: () = conn
            .lpush(&self.pending, payload)
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn receive(&self) -> Vec<QueuedMessage> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    target = "stocksync.queue",
                    error = %err,
                    "could not reach queue backend"
                );
                return Vec::new();
            }
        };

        let mut messages = Vec::new();
        while messages.len() < self.batch_size {
            let moved: Option<String> = match redis::cmd("LMOVE")
                .arg(&self.pending)
                .arg(&self.inflight)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
            {
                Ok(moved) => moved,
                Err(err) => {
                    warn!(
                        target = "stocksync.queue",
                        error = %err,
                        "error receiving order notifications"
                    );
                    break;
                }
            };
            let Some(raw) = moved else { break };

            let notification: OrderNotification = match serde_json::from_str(&raw) {
                Ok(notification) => notification,
                Err(err) => {
                    warn!(
                        target = "stocksync.queue",
                        error = %err,
                        "dropping undecodable notification"
                    );
                    let _: Result<i64, _> = conn.lrem(&self.inflight, 1, &raw).await;
                    continue;
                }
            };
            let Some(order_id) = notification.order_id().map(str::to_string) else {
                warn!(
                    target = "stocksync.queue",
                    notification_id = %notification.id,
                    resource = %notification.resource,
                    "dropping notification without an order id"
                );
                let _: Result<i64, _> = conn.lrem(&self.inflight, 1, &raw).await;
                continue;
            };

            messages.push(QueuedMessage {
                account_id: notification.user_id.to_string(),
                order_id,
                attempts: notification.attempts,
                receipt: ReceiptHandle::new(raw),
            });
        }
        messages
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        // LREM returns the number of removed entries; zero means the
        // handle already expired, which is fine.
        let _: i64 = conn
            .lrem(&self.inflight, 1, receipt.as_str())
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        Ok(())
    }
}
