use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductKind {
    OneTime,
    Subscription,
}

/// A purchasable credit package, keyed by the payment provider's product id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Credits granted per purchase or per paid subscription period
    pub credits: i64,
    pub kind: ProductKind,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProduct {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub kind: ProductKind,
}
