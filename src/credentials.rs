use crate::meli::auth;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

// Tokens this close to expiry are refreshed before the pipeline uses them.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Access material for one marketplace account. Read-only for the
/// pipeline; refresh happens inside the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub store_id: Uuid,
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// The credential that owns the notified order plus every other account
/// registered by the same seller, needed for cross-account clone lookup.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub owner: Credential,
    pub all: Vec<Credential>,
}

impl CredentialSet {
    pub fn for_account(&self, account_id: &str) -> Option<&Credential> {
        self.all
            .iter()
            .find(|credential| credential.account_id == account_id)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials registered for account {0}")]
    NotFound(String),
    #[error("credential backend request failed: {0}")]
    Request(String),
    #[error("invalid credential payload: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn for_account(&self, account_user_id: &str) -> Result<CredentialSet, CredentialError>;
}

/// PostgREST-backed resolver sharing the order store's backend.
#[derive(Debug, Clone)]
pub struct RestCredentialResolver {
    base_url: String,
    service_key: String,
    http: Client,
}

impl RestCredentialResolver {
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

    async fn fetch_rows(&self, filter: &str) -> Result<Vec<Credential>, CredentialError> {
        let url = format!(
            "{}/rest/v1/marketplace_credentials?{}&select=*",
            self.base_url, filter
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|err| CredentialError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CredentialError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| CredentialError::Deserialize(err.to_string()))
    }

    /// Refresh a stale credential through the marketplace OAuth endpoint
    /// and persist the rotated tokens best-effort. A failed refresh keeps
    /// the stale credential; the pipeline will surface the auth failure.
    async fn refreshed(&self, credential: Credential) -> Credential {
        let margin = Duration::minutes(EXPIRY_MARGIN_MINUTES);
        if credential.expires_at > Utc::now() + margin {
            return credential;
        }
        let grant = match auth::refresh_access_token(&self.http, &credential.refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                warn!(
                    target = "stocksync.credentials",
                    account_id = %credential.account_id,
                    error = %err,
                    "token refresh failed, keeping stale credential"
                );
                return credential;
            }
        };
        let refreshed = Credential {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
            ..credential
        };
        self.persist_tokens(&refreshed).await;
        refreshed
    }

    async fn persist_tokens(&self, credential: &Credential) {
        let url = format!(
            "{}/rest/v1/marketplace_credentials?account_id=eq.{}",
            self.base_url, credential.account_id
        );
        let body = json!({
            "access_token": credential.access_token,
            "refresh_token": credential.refresh_token,
            "expires_at": credential.expires_at,
        });
        let result = self
            .http
            .patch(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                target = "stocksync.credentials",
                account_id = %credential.account_id,
                status = %response.status(),
                "could not persist rotated tokens"
            ),
            Err(err) => warn!(
                target = "stocksync.credentials",
                account_id = %credential.account_id,
                error = %err,
                "could not persist rotated tokens"
            ),
        }
    }
}

#[async_trait]
impl CredentialResolver for RestCredentialResolver {
    async fn for_account(&self, account_user_id: &str) -> Result<CredentialSet, CredentialError> {
        let owner_rows = self
            .fetch_rows(&format!("account_id=eq.{account_user_id}&limit=1"))
            .await?;
        let Some(owner_row) = owner_rows.into_iter().next() else {
            return Err(CredentialError::NotFound(account_user_id.to_string()));
        };

        let rows = self
            .fetch_rows(&format!("store_id=eq.{}", owner_row.store_id))
            .await?;

        let mut all = Vec::with_capacity(rows.len());
        for row in rows {
            all.push(self.refreshed(row).await);
        }

        let owner = all
            .iter()
            .find(|credential| credential.account_id == account_user_id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(account_user_id.to_string()))?;

        Ok(CredentialSet { owner, all })
    }
}
