use crate::meli::config::ENDPOINT;
use crate::meli::MeliError;
use crate::models::{FetchedOrder, OrderLineItem, OrderStatus};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: u64,
    date_created: DateTime<Utc>,
    status: String,
    #[serde(default)]
    order_items: Vec<OrderItemEntry>,
}

#[derive(Debug, Deserialize)]
struct OrderItemEntry {
    item: OrderItemBody,
    quantity: i32,
}

#[derive(Debug, Deserialize)]
struct OrderItemBody {
    id: String,
    title: String,
    #[serde(default)]
    seller_sku: Option<String>,
}

pub async fn fetch_order(
    client: &Client,
    order_id: &str,
    access_token: &str,
) -> Result<FetchedOrder, MeliError> {
    let url = format!("{}/orders/{order_id}", *ENDPOINT);
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

    let payload: OrderResponse = response
        .json()
        .await
        .map_err(|err| MeliError::permanent(err.to_string()))?;

    let items = payload
        .order_items
        .into_iter()
        .map(|entry| OrderLineItem {
            listing_id: entry.item.id,
            title: entry.item.title,
            sku: entry.item.seller_sku.unwrap_or_default(),
            quantity: entry.quantity,
        })
        .collect();

    Ok(FetchedOrder {
        order_id: payload.id.to_string(),
        created_at: payload.date_created,
        status: OrderStatus::parse(&payload.status),
        items,
    })
}
