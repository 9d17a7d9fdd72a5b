use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Webhook payload sent by the marketplace whenever an order changes.
///
/// The body is enqueued verbatim; the order id is not a field of its own
/// but the trailing segment of `resource` (e.g. `/orders/2195160686`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNotification {
    #[serde(rename = "_id")]
    pub id: String,
    pub resource: String,
    pub user_id: i64,
    pub topic: String,
    #[serde(default)]
    pub application_id: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub received: Option<DateTime<Utc>>,
}

impl OrderNotification {
    /// Trailing path segment of `resource`, if any.
    pub fn order_id(&self) -> Option<&str> {
        self.resource
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Confirmed,
    PaymentRequired,
    PaymentInProcess,
    PartiallyPaid,
    Paid,
    PartiallyRefunded,
    PendingCancel,
    Cancelled,
    Invalid,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::PaymentRequired => "payment_required",
            OrderStatus::PaymentInProcess => "payment_in_process",
            OrderStatus::PartiallyPaid => "partially_paid",
            OrderStatus::Paid => "paid",
            OrderStatus::PartiallyRefunded => "partially_refunded",
            OrderStatus::PendingCancel => "pending_cancel",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Invalid => "invalid",
            OrderStatus::Unknown => "unknown",
        }
    }

    pub fn parse(input: &str) -> Self {
        match input {
            "confirmed" => OrderStatus::Confirmed,
            "payment_required" => OrderStatus::PaymentRequired,
            "payment_in_process" => OrderStatus::PaymentInProcess,
            "partially_paid" => OrderStatus::PartiallyPaid,
            "paid" => OrderStatus::Paid,
            "partially_refunded" => OrderStatus::PartiallyRefunded,
            "pending_cancel" => OrderStatus::PendingCancel,
            "cancelled" => OrderStatus::Cancelled,
            "invalid" => OrderStatus::Invalid,
            _ => OrderStatus::Unknown,
        }
    }
}

/// One line of the canonical order as the marketplace reports it.
///
/// `sku` may be empty; such lines cannot be matched to clones and are
/// skipped during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLineItem {
    pub listing_id: String,
    pub title: String,
    pub sku: String,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct FetchedOrder {
    pub order_id: String,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub items: Vec<OrderLineItem>,
}

/// A clone sharing a SKU with an ordered item, possibly under another
/// seller account.
#[derive(Debug, Clone)]
pub struct SiblingListing {
    pub listing_id: String,
    pub title: String,
    pub sku: String,
    pub available_quantity: i32,
}

/// A planned stock adjustment for one sibling listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityChange {
    pub listing_id: String,
    pub title: String,
    pub sku: String,
    pub new_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedOrderItem {
    pub title: String,
    pub quantity: i32,
    pub sku: String,
}

/// The durable record written exactly once per marketplace order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedOrder {
    pub id: Uuid,
    pub marketplace_id: String,
    pub store_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub items: Vec<PersistedOrderItem>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_is_trailing_resource_segment() {
        let notification = OrderNotification {
            id: "not-1".to_string(),
            resource: "/orders/2195160686".to_string(),
            user_id: 123,
            topic: "orders_v2".to_string(),
            application_id: 0,
            attempts: 1,
            sent: None,
            received: None,
        };
        assert_eq!(notification.order_id(), Some("2195160686"));
    }

    #[test]
    fn order_id_tolerates_trailing_slash_and_rejects_empty() {
        let mut notification = OrderNotification {
            id: "not-2".to_string(),
            resource: "/orders/42/".to_string(),
            user_id: 1,
            topic: "orders_v2".to_string(),
            application_id: 0,
            attempts: 0,
            sent: None,
            received: None,
        };
        assert_eq!(notification.order_id(), Some("42"));
        notification.resource = "/".to_string();
        assert_eq!(notification.order_id(), None);
    }

    #[test]
    fn status_round_trips_all_known_values() {
        let values = [
            OrderStatus::Confirmed,
            OrderStatus::PaymentRequired,
            OrderStatus::PaymentInProcess,
            OrderStatus::PartiallyPaid,
            OrderStatus::Paid,
            OrderStatus::PartiallyRefunded,
            OrderStatus::PendingCancel,
            OrderStatus::Cancelled,
            OrderStatus::Invalid,
        ];
        for status in values {
            assert_eq!(OrderStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unrecognized_status_falls_back_to_unknown() {
        assert_eq!(OrderStatus::parse("not_a_status"), OrderStatus::Unknown);
        let decoded: OrderStatus = serde_json::from_str("\"whatever\"").expect("deserialize");
        assert_eq!(decoded, OrderStatus::Unknown);
    }
}
