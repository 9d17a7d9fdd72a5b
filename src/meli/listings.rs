use crate::meli::config::ENDPOINT;
use crate::meli::MeliError;
use crate::models::SiblingListing;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use urlencoding::encode;

// Multiget accepts at most 20 ids per request.
const MULTIGET_CHUNK: usize = 20;

#[derive(Debug, Deserialize)]
struct SkuSearchResponse {
    #[serde(default)]
    results: Vec<String>,
}

/// Listing ids owned by `account_user_id` that carry the given seller SKU.
pub async fn search_ids_by_sku(
    client: &Client,
    sku: &str,
    account_user_id: &str,
    access_token: &str,
) -> Result<Vec<String>, MeliError> {
    let url = format!(
        "{}/users/{}/items/search?seller_sku={}",
        *ENDPOINT,
        account_user_id,
        encode(sku)
    );
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(MeliError::from_request)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(MeliError::from_status(status, &body));
    }

    let payload: SkuSearchResponse = response
        .json()
        .await
        .map_err(|err| MeliError::permanent(err.to_string()))?;
    Ok(payload.results)
}

#[derive(Debug, Deserialize)]
struct MultiGetEntry {
    code: u16,
    body: ListingBody,
}

#[derive(Debug, Deserialize)]
struct ListingBody {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    available_quantity: i32,
    #[serde(default)]
    attributes: Vec<ListingAttribute>,
}

#[derive(Debug, Deserialize)]
struct ListingAttribute {
    id: String,
    #[serde(default)]
    value_name: Option<String>,
}

/// Fetch listing details in bulk. A partial multiget (any entry not 200)
/// is treated as transient: the batch is expected to resolve on retry.
pub async fn get_listings(
    client: &Client,
    ids: &[String],
    access_token: &str,
) -> Result<Vec<SiblingListing>, MeliError> {
    let mut listings = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MULTIGET_CHUNK) {
        let url = format!("{}/items?ids={}", *ENDPOINT, chunk.join(","));
        let response = client
            .get(url)
            .header("Accept", "application/json")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(MeliError::from_request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeliError::from_status(status, &body));
        }

        let entries: Vec<MultiGetEntry> = response
            .json()
            .await
            .map_err(|err| MeliError::permanent(err.to_string()))?;

        for entry in entries {
            if entry.code != 200 {
                return Err(MeliError::transient(format!(
                    "multiget returned {} for listing {}",
                    entry.code, entry.body.id
                )));
            }
            let sku = entry
                .body
                .attributes
                .iter()
                .find(|attribute| attribute.id == "SELLER_SKU")
                .and_then(|attribute| attribute.value_name.clone())
                .unwrap_or_default();
            listings.push(SiblingListing {
                listing_id: entry.body.id,
                title: entry.body.title,
                sku,
                available_quantity: entry.body.available_quantity,
            });
        }
    }
    Ok(listings)
}

pub async fn update_quantity(
    client: &Client,
    listing_id: &str,
    quantity: i32,
    access_token: &str,
) -> Result<(), MeliError> {
    let url = format!("{}/items/{listing_id}", *ENDPOINT);
    let body = json!({ "available_quantity": quantity });
    let response = client
        .put(url)
        .header("Accept", "application/json")
        .bearer_auth(access_token)
        .json(&body)
        .send()
        .await
        .map_err(MeliError::from_request)?;

    let status = response.status();
    if !status.is_success() && status != reqwest::StatusCode::NO_CONTENT {
        let body = response.text().await.unwrap_or_default();
        return Err(MeliError::from_status(status, &body));
    }
    Ok(())
}
