use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::error::{AppError, Result, msg};

type HmacSha256 = Hmac<Sha256>;

/// Prediction as reported by WaveSpeed, both in API responses and webhook bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct WaveSpeedPrediction {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    pub status: String,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WaveSpeedPrediction {
    /// Parse a webhook body. Accepts the bare prediction or the `{code, data}` API envelope.
    pub fn from_webhook_body(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let prediction = match value.get("data") {
            Some(data) if data.is_object() => data.clone(),
            _ => value,
        };
        Ok(serde_json::from_value(prediction)?)
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<WaveSpeedPrediction>,
}

/// Why a submission did not yield a prediction id.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// WaveSpeed never got the task or refused it
    #[error("{0}")]
    Rejected(String),
    /// WaveSpeed may have accepted the task; only its webhook will tell
    #[error("{0}")]
    Unknown(String),
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WaveSpeedClient {
    client: Client,
    api_key: String,
    api_url: String,
    webhook_secret: String,
}

impl WaveSpeedClient {
    /// Webhooks older than this are rejected
    pub const WEBHOOK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;
    /// Allowed clock skew for timestamps from the future
    pub const WEBHOOK_FUTURE_SKEW_SECS: i64 = 60;

    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.webhook_secret.is_empty()
    }

    /// Submit a generation task. Returns the provider's prediction id.
    ///
    /// Failures are split by whether WaveSpeed may still run the task: a
    /// refused connection or an explicit refusal is `Rejected`, while a
    /// timeout or an unreadable success response is `Unknown`.
    pub async fn submit_task(
        &self,
        model: &str,
        input: &serde_json::Value,
        webhook_url: &str,
    ) -> std::result::Result<String, SubmitError> {
        let url = format!("{}/{}", self.api_url, model);

        let response = self
            .client
            .post(&url)
            .query(&[("webhook", webhook_url)])
            .bearer_auth(&self.api_key)
            .json(input)
            .send()
            .await
            .map_err(|e| {
                let detail = format!("WaveSpeed request failed: {}", e);
                if e.is_connect() || e.is_builder() {
                    SubmitError::Rejected(detail)
                } else {
                    SubmitError::Unknown(detail)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected(format!(
                "WaveSpeed returned {}: {}",
                status, error_text
            )));
        }

        let envelope: ApiEnvelope = response.json().await.map_err(|e| {
            SubmitError::Unknown(format!("Failed to parse WaveSpeed response: {}", e))
        })?;

        if envelope.code != 200 {
            return Err(SubmitError::Rejected(format!(
                "WaveSpeed rejected task (code {}): {}",
                envelope.code,
                envelope.message.unwrap_or_default()
            )));
        }

        envelope
            .data
            .map(|p| p.id)
            .ok_or_else(|| SubmitError::Unknown("WaveSpeed response missing prediction".into()))
    }

    /// Verify a webhook delivery.
    ///
    /// The signature header is `v3,<hex>` where hex is HMAC-SHA256 over
    /// `"{webhook_id}.{timestamp}.{body}"`. Several space-separated
    /// signatures may be present during secret rotation.
    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        webhook_id: &str,
        timestamp: &str,
        signature_header: &str,
    ) -> Result<bool> {
        if !self.is_configured() {
            return Err(AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()));
        }

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| AppError::BadRequest(msg::INVALID_TIMESTAMP_IN_SIGNATURE.into()))?;

        let Some(age) = chrono::Utc::now().timestamp().checked_sub(ts) else {
            tracing::warn!("WaveSpeed webhook rejected: timestamp out of range ({})", ts);
            return Ok(false);
        };
        if age > Self::WEBHOOK_TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                "WaveSpeed webhook rejected: timestamp too old (age={}s, max={}s)",
                age,
                Self::WEBHOOK_TIMESTAMP_TOLERANCE_SECS
            );
            return Ok(false);
        }
        if age < -Self::WEBHOOK_FUTURE_SKEW_SECS {
            tracing::warn!("WaveSpeed webhook rejected: timestamp in the future (age={}s)", age);
            return Ok(false);
        }

        let candidates: Vec<&str> = signature_header
            .split_whitespace()
            .filter_map(|part| part.strip_prefix("v3,"))
            .collect();
        if candidates.is_empty() {
            return Err(AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()));
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()))?;
        mac.update(webhook_id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.trim().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());
        let expected_bytes = expected.as_bytes();

        Ok(candidates.iter().any(|candidate| {
            let provided = candidate.as_bytes();
            provided.len() == expected_bytes.len() && bool::from(expected_bytes.ct_eq(provided))
        }))
    }
}
