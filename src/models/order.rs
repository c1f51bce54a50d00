use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderKind {
    Purchase,
    Renewal,
    Refund,
}

/// A payment-derived record. Created at most once per provider order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub provider: String,
    pub provider_order_id: String,
    pub product_id: Option<String>,
    /// Amount in minor units; negative for refunds
    pub amount_cents: i64,
    pub currency: String,
    /// Credits granted (positive) or clawed back (negative)
    pub credits: i64,
    pub kind: OrderKind,
    /// For refunds: the order being refunded
    pub parent_order_id: Option<String>,
    pub event_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub account_id: String,
    pub provider: String,
    pub provider_order_id: String,
    pub product_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub credits: i64,
    pub kind: OrderKind,
    pub parent_order_id: Option<String>,
    pub event_id: String,
}
