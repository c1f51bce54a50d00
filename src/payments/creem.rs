use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result, msg};

use super::{Expandable, HasId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CreemClient {
    webhook_secret: String,
}

impl CreemClient {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.webhook_secret.is_empty()
    }

    /// Verify the `creem-signature` header: hex HMAC-SHA256 of the raw body.
    pub fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> Result<bool> {
        if !self.is_configured() {
            return Err(AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()));
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()))?;
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        let expected_bytes = expected.as_bytes();
        let provided_bytes = signature.trim().as_bytes();

        // Signature length is not secret (always 64 hex chars)
        if expected_bytes.len() != provided_bytes.len() {
            return Ok(false);
        }

        Ok(expected_bytes.ct_eq(provided_bytes).into())
    }
}

/// Envelope of every Creem webhook delivery.
#[derive(Debug, Deserialize)]
pub struct CreemWebhookEvent {
    pub id: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreemMetadata {
    #[serde(alias = "userId", alias = "account_id")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreemCustomer {
    pub id: String,
    pub email: Option<String>,
}

impl HasId for CreemCustomer {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreemProduct {
    pub id: String,
    pub price: Option<i64>,
    pub currency: Option<String>,
}

impl HasId for CreemProduct {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreemOrder {
    pub id: String,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
}

impl HasId for CreemOrder {
    fn id(&self) -> &str {
        &self.id
    }
}

/// `checkout.completed` object
#[derive(Debug, Clone, Deserialize)]
pub struct CreemCheckout {
    pub id: String,
    pub order: Option<CreemOrder>,
    pub product: Option<Expandable<CreemProduct>>,
    pub customer: Option<Expandable<CreemCustomer>>,
    #[serde(default)]
    pub metadata: Option<CreemMetadata>,
}

/// `subscription.paid` object
#[derive(Debug, Clone, Deserialize)]
pub struct CreemSubscription {
    pub id: String,
    pub product: Option<Expandable<CreemProduct>>,
    pub customer: Option<Expandable<CreemCustomer>>,
    #[serde(default)]
    pub metadata: Option<CreemMetadata>,
    /// Transaction that paid the current period
    pub last_transaction_id: Option<String>,
    pub status: Option<String>,
}

/// `refund.created` object
#[derive(Debug, Clone, Deserialize)]
pub struct CreemRefund {
    pub id: String,
    pub refund_amount: Option<i64>,
    pub refund_currency: Option<String>,
    pub order: Option<Expandable<CreemOrder>>,
}
