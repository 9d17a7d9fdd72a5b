use crate::models::PersistedOrder;
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order store request failed: {0}")]
    Request(String),
    #[error("invalid order store response: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, marketplace_id: &str) -> Result<Option<PersistedOrder>, StoreError>;

    /// Insert must be idempotent under redelivery: a conflict on the
    /// marketplace id is a no-op, never an error.
    async fn put(&self, order: &PersistedOrder) -> Result<(), StoreError>;
}

/// PostgREST-backed order store.
#[derive(Debug, Clone)]
pub struct RestOrderStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl RestOrderStore {
    pub fn from_env(http: Client) -> Option<Self> {
        let base_url = std::env::var("STORE_API_URL").ok()?;
        let service_key = std::env::var("STORE_API_KEY").ok()?;
        Some(Self::new(base_url, service_key, http))
    }

    pub fn new(base_url: String, service_key: String, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http,
        }
    }
}

#[async_trait]
impl OrderStore for RestOrderStore {
    async fn get(&self, marketplace_id: &str) -> Result<Option<PersistedOrder>, StoreError> {
        let url = format!(
            "{}/rest/v1/orders?marketplace_id=eq.{}&select=*&limit=1",
            self.base_url, marketplace_id
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }

        let mut payload: Vec<PersistedOrder> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(payload.pop())
    }

    async fn put(&self, order: &PersistedOrder) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/orders", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Prefer", "resolution=ignore-duplicates")
            .json(&[order])
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}
