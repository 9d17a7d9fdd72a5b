pub mod auth;
pub mod config;
pub mod listings;
pub mod orders;

use crate::credentials::CredentialSet;
use crate::models::{FetchedOrder, SiblingListing};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;

/// Classification every marketplace call must carry so the pipeline can
/// decide between a bounded retry and a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeliErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
#[error("marketplace request failed: {message}")]
pub struct MeliError {
    kind: MeliErrorKind,
    message: String,
}

impl MeliError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: MeliErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: MeliErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Rate limiting and server-side failures are worth one more attempt;
    /// any other non-success status is treated as final.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }

    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::transient(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }

    pub fn kind(&self) -> MeliErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == MeliErrorKind::Transient
    }
}

/// Sibling clones found for one SKU under one seller account, together
/// with the account that owns them so the right token is used for the
/// outbound update.
#[derive(Debug, Clone)]
pub struct AccountSiblings {
    pub account_id: String,
    pub listings: Vec<SiblingListing>,
}

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn fetch_order(
        &self,
        order_id: &str,
        access_token: &str,
    ) -> Result<FetchedOrder, MeliError>;

    /// Discover clones sharing `sku` across every account in the
    /// credential set.
    async fn find_by_sku(
        &self,
        sku: &str,
        credentials: &CredentialSet,
    ) -> Result<Vec<AccountSiblings>, MeliError>;

    async fn update_quantity(
        &self,
        listing_id: &str,
        quantity: i32,
        access_token: &str,
    ) -> Result<(), MeliError>;
}

#[derive(Debug, Clone)]
pub struct MeliClient {
    http: Client,
}

impl MeliClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MarketplaceApi for MeliClient {
    async fn fetch_order(
        &self,
        order_id: &str,
        access_token: &str,
    ) -> Result<FetchedOrder, MeliError> {
        orders::fetch_order(&self.http, order_id, access_token).await
    }

    async fn find_by_sku(
        &self,
        sku: &str,
        credentials: &CredentialSet,
    ) -> Result<Vec<AccountSiblings>, MeliError> {
        let mut found = Vec::new();
        for credential in &credentials.all {
            let ids = listings::search_ids_by_sku(
                &self.http,
                sku,
                &credential.account_id,
                &credential.access_token,
            )
            .await?;
            if ids.is_empty() {
                continue;
            }
            let siblings =
                listings::get_listings(&self.http, &ids, &credential.access_token).await?;
            found.push(AccountSiblings {
                account_id: credential.account_id.clone(),
                listings: siblings,
            });
        }
        if found.is_empty() {
            return Err(MeliError::permanent(format!(
                "no clones found for sku {sku}"
            )));
        }
        Ok(found)
    }

    async fn update_quantity(
        &self,
        listing_id: &str,
        quantity: i32,
        access_token: &str,
    ) -> Result<(), MeliError> {
        listings::update_quantity(&self.http, listing_id, quantity, access_token).await
    }
}
