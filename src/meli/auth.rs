use crate::meli::config::{APP_ID, APP_SECRET, OAUTH_TOKEN_URL};
use crate::meli::MeliError;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Exchange a refresh token for a fresh access token.
///
/// The marketplace rotates the refresh token on every grant, so callers
/// must store both tokens from the response.
pub async fn refresh_access_token(
    client: &Client,
    refresh_token: &str,
) -> Result<TokenGrant, MeliError> {
    if APP_ID.is_empty() || APP_SECRET.is_empty() {
        return Err(MeliError::permanent("missing marketplace app credentials"));
    }
    let body = json!({
        "grant_type": "refresh_token",
        "client_id": APP_ID.as_str(),
        "client_secret": APP_SECRET.as_str(),
        "refresh_token": refresh_token,
    });
    let response = client
        .post(OAUTH_TOKEN_URL.as_str())
        .header("Accept", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(MeliError::from_request)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(MeliError::from_status(status, &body));
    }

    response
        .json()
        .await
        .map_err(|err| MeliError::permanent(err.to_string()))
}
