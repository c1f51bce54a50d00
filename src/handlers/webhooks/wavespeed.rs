use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::db::AppState;
use crate::generation::WaveSpeedPrediction;

use super::common::{
    TaskCompletionData, TaskFailureData, WebhookEvent, WebhookProvider, WebhookResult,
    handle_webhook,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, WebhookResult> {
    headers
        .get(name)
        .ok_or((StatusCode::BAD_REQUEST, "Missing webhook signature headers"))?
        .to_str()
        .map_err(|e| {
            tracing::debug!("Invalid UTF-8 in {} header: {}", name, e);
            (StatusCode::BAD_REQUEST, "Invalid signature header")
        })
}

/// Query string we put on the webhook URL at submission.
#[derive(Debug, Default, Deserialize)]
pub struct WaveSpeedWebhookQuery {
    pub task_id: Option<String>,
}

/// WaveSpeed (generation task) webhook provider implementation.
#[derive(Debug, Default)]
pub struct WaveSpeedWebhookProvider {
    /// Our task id from the webhook URL; finds tasks whose prediction id was never stored
    pub task_id: Option<String>,
}

impl WebhookProvider for WaveSpeedWebhookProvider {
    fn provider_name(&self) -> &'static str {
        "wavespeed"
    }

    fn verify_request(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<(), WebhookResult> {
        let webhook_id = header(headers, "webhook-id")?;
        let timestamp = header(headers, "webhook-timestamp")?;
        let signature = header(headers, "webhook-signature")?;

        if !state.wavespeed.is_configured() {
            tracing::error!("WAVESPEED_WEBHOOK_SECRET is not configured, rejecting webhook");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Webhook secret not configured"));
        }

        match state
            .wavespeed
            .verify_webhook_signature(body, webhook_id, timestamp, signature)
        {
            Ok(true) => Ok(()),
            Ok(false) => Err((StatusCode::UNAUTHORIZED, "Invalid signature")),
            Err(e) => {
                tracing::debug!("Malformed WaveSpeed signature: {}", e);
                Err((StatusCode::BAD_REQUEST, "Invalid signature header"))
            }
        }
    }

    fn parse_event(&self, _headers: &HeaderMap, body: &Bytes) -> Result<WebhookEvent, WebhookResult> {
        let prediction = WaveSpeedPrediction::from_webhook_body(body).map_err(|e| {
            tracing::error!("Failed to parse WaveSpeed webhook: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid JSON")
        })?;

        // A task reaches each terminal status once, whatever the delivery id
        let event_id = format!("{}:{}", prediction.id, prediction.status);
        let event_type = format!("task.{}", prediction.status);

        match prediction.status.as_str() {
            "completed" => Ok(WebhookEvent::TaskCompleted(TaskCompletionData {
                event_id,
                event_type,
                provider_task_id: prediction.id,
                task_id: self.task_id.clone(),
                outputs: prediction.outputs,
            })),
            "failed" => Ok(WebhookEvent::TaskFailed(TaskFailureData {
                event_id,
                event_type,
                provider_task_id: prediction.id,
                task_id: self.task_id.clone(),
                error: prediction
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Generation failed".to_string()),
            })),
            _ => Ok(WebhookEvent::Ignored),
        }
    }
}

pub async fn handle_wavespeed_webhook(
    State(state): State<AppState>,
    Query(query): Query<WaveSpeedWebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provider = WaveSpeedWebhookProvider {
        task_id: query.task_id.filter(|id| !id.is_empty()),
    };
    handle_webhook(&provider, &state, headers, body).await
}
