use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::de::DeserializeOwned;

use crate::db::AppState;
use crate::models::OrderKind;
use crate::payments::{
    CreemCheckout, CreemCustomer, CreemRefund, CreemSubscription, CreemWebhookEvent, Expandable,
};

use super::common::{
    AccountRef, PaymentData, RefundData, WebhookEvent, WebhookProvider, WebhookResult,
    handle_webhook,
};

const DEFAULT_CURRENCY: &str = "USD";

/// Creem webhook provider implementation.
pub struct CreemWebhookProvider;

impl WebhookProvider for CreemWebhookProvider {
    fn provider_name(&self) -> &'static str {
        "creem"
    }

    fn verify_request(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<(), WebhookResult> {
        let signature = headers
            .get("creem-signature")
            .ok_or((StatusCode::BAD_REQUEST, "Missing creem-signature header"))?
            .to_str()
            .map_err(|e| {
                tracing::debug!("Invalid UTF-8 in Creem signature header: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid signature header")
            })?;

        if !state.creem.is_configured() {
            // 5xx so Creem keeps retrying until the secret is configured
            tracing::error!("CREEM_WEBHOOK_SECRET is not configured, rejecting webhook");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Webhook secret not configured"));
        }

        match state.creem.verify_webhook_signature(body, signature) {
            Ok(true) => Ok(()),
            Ok(false) => Err((StatusCode::UNAUTHORIZED, "Invalid signature")),
            Err(e) => {
                tracing::error!("Signature verification error: {}", e);
                Err((StatusCode::INTERNAL_SERVER_ERROR, "Signature verification failed"))
            }
        }
    }

    fn parse_event(&self, _headers: &HeaderMap, body: &Bytes) -> Result<WebhookEvent, WebhookResult> {
        let event: CreemWebhookEvent = serde_json::from_slice(body).map_err(|e| {
            tracing::error!("Failed to parse Creem webhook: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid JSON")
        })?;

        match event.event_type.as_str() {
            "checkout.completed" => parse_checkout_completed(&event),
            "subscription.paid" => parse_subscription_paid(&event),
            "refund.created" => parse_refund_created(&event),
            _ => Ok(WebhookEvent::Ignored),
        }
    }
}

fn parse_object<T: DeserializeOwned>(event: &CreemWebhookEvent) -> Result<T, WebhookResult> {
    serde_json::from_value(event.object.clone()).map_err(|e| {
        tracing::error!("Invalid Creem {} object in event {}: {}", event.event_type, event.id, e);
        (StatusCode::BAD_REQUEST, "Invalid event object")
    })
}

fn customer_email(customer: &Option<Expandable<CreemCustomer>>) -> Option<String> {
    customer
        .as_ref()
        .and_then(|c| c.object())
        .and_then(|c| c.email.clone())
}

fn parse_checkout_completed(event: &CreemWebhookEvent) -> Result<WebhookEvent, WebhookResult> {
    let checkout: CreemCheckout = parse_object(event)?;

    let order = checkout
        .order
        .as_ref()
        .ok_or((StatusCode::OK, "No order in checkout"))?;

    if let Some(status) = order.status.as_deref() {
        if status != "paid" {
            return Err((StatusCode::OK, "Order not paid"));
        }
    }

    let product = checkout
        .product
        .as_ref()
        .ok_or((StatusCode::OK, "No product in checkout"))?;

    let currency = order
        .currency
        .clone()
        .or_else(|| product.object().and_then(|p| p.currency.clone()))
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    Ok(WebhookEvent::Payment(PaymentData {
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
        kind: OrderKind::Purchase,
        provider_order_id: order.id.clone(),
        product_id: product.id().to_string(),
        account: AccountRef {
            account_id: checkout.metadata.as_ref().and_then(|m| m.user_id.clone()),
            email: customer_email(&checkout.customer),
        },
        amount_cents: order.amount.unwrap_or(0),
        currency,
    }))
}

fn parse_subscription_paid(event: &CreemWebhookEvent) -> Result<WebhookEvent, WebhookResult> {
    let subscription: CreemSubscription = parse_object(event)?;

    let product = subscription
        .product
        .as_ref()
        .ok_or((StatusCode::OK, "No product in subscription"))?;

    // One paid period = one transaction; fall back to the event id
    let provider_order_id = subscription
        .last_transaction_id
        .clone()
        .unwrap_or_else(|| event.id.clone());

    let product_obj = product.object();

    Ok(WebhookEvent::Payment(PaymentData {
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
        kind: OrderKind::Renewal,
        provider_order_id,
        product_id: product.id().to_string(),
        account: AccountRef {
            account_id: subscription.metadata.as_ref().and_then(|m| m.user_id.clone()),
            email: customer_email(&subscription.customer),
        },
        amount_cents: product_obj.and_then(|p| p.price).unwrap_or(0),
        currency: product_obj
            .and_then(|p| p.currency.clone())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
    }))
}

fn parse_refund_created(event: &CreemWebhookEvent) -> Result<WebhookEvent, WebhookResult> {
    let refund: CreemRefund = parse_object(event)?;

    let order = refund
        .order
        .as_ref()
        .ok_or((StatusCode::OK, "No order in refund"))?;

    Ok(WebhookEvent::Refund(RefundData {
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
        refund_id: refund.id.clone(),
        original_order_id: order.id().to_string(),
        amount_cents: refund.refund_amount.unwrap_or(0),
        currency: refund
            .refund_currency
            .clone()
            .or_else(|| order.object().and_then(|o| o.currency.clone()))
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
    }))
}

pub async fn handle_creem_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&CreemWebhookProvider, &state, headers, body).await
}
