//! Common webhook handling infrastructure.
//!
//! Every provider delivery goes through the same pipeline: verify the
//! signature, parse into a provider-agnostic [`WebhookEvent`], then settle it
//! through [`settle_once`]. The gate claims `(provider, event_id)` in
//! `webhook_events` and applies the settlement in the same transaction, so a
//! redelivery either sees the committed claim and short-circuits, or (if the
//! first attempt failed part-way) finds nothing and starts over.

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
};
use rusqlite::{Connection, TransactionBehavior};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result, msg};
use crate::models::{
    Account, CreateOrder, EventOutcome, LedgerReason, OrderKind, ProductKind, Task, TaskStatus,
};

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

/// How to find the account a payment belongs to.
#[derive(Debug, Clone, Default)]
pub struct AccountRef {
    /// Our account id, passed through checkout metadata
    pub account_id: Option<String>,
    /// Customer email, used when metadata is missing
    pub email: Option<String>,
}

/// A completed payment (first purchase or subscription period).
#[derive(Debug)]
pub struct PaymentData {
    pub event_id: String,
    pub event_type: String,
    pub kind: OrderKind,
    pub provider_order_id: String,
    pub product_id: String,
    pub account: AccountRef,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug)]
pub struct RefundData {
    pub event_id: String,
    pub event_type: String,
    pub refund_id: String,
    /// Provider order id of the purchase being refunded
    pub original_order_id: String,
    /// Amount refunded in minor units (positive)
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug)]
pub struct TaskCompletionData {
    pub event_id: String,
    pub event_type: String,
    pub provider_task_id: String,
    /// Our task id, when the webhook URL carried one
    pub task_id: Option<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug)]
pub struct TaskFailureData {
    pub event_id: String,
    pub event_type: String,
    pub provider_task_id: String,
    pub task_id: Option<String>,
    pub error: String,
}

/// Parsed webhook event with provider-agnostic data.
#[derive(Debug)]
pub enum WebhookEvent {
    Payment(PaymentData),
    Refund(RefundData),
    TaskCompleted(TaskCompletionData),
    TaskFailed(TaskFailureData),
    /// Event type that settles nothing
    Ignored,
}

impl WebhookEvent {
    /// Idempotency key and event type, `None` for ignored events.
    pub fn key(&self) -> Option<(&str, &str)> {
        match self {
            Self::Payment(d) => Some((&d.event_id, &d.event_type)),
            Self::Refund(d) => Some((&d.event_id, &d.event_type)),
            Self::TaskCompleted(d) => Some((&d.event_id, &d.event_type)),
            Self::TaskFailed(d) => Some((&d.event_id, &d.event_type)),
            Self::Ignored => None,
        }
    }
}

/// Provider-specific half of webhook handling.
pub trait WebhookProvider: Send + Sync {
    /// Provider name for logging and database storage (e.g., "creem", "wavespeed")
    fn provider_name(&self) -> &'static str;

    /// Check the request's signature headers against the raw body.
    fn verify_request(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> std::result::Result<(), WebhookResult>;

    /// Parse the webhook payload into a provider-agnostic event.
    fn parse_event(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> std::result::Result<WebhookEvent, WebhookResult>;
}

/// What a first delivery settled into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Balance and derived record written; `entity_id` is the order or task
    Applied { entity_id: String },
    /// Recorded but nothing to apply
    Skipped(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Settled(Settlement),
    /// Event already recorded by an earlier delivery
    AlreadyProcessed,
}

/// Claim an event and apply its settlement exactly once.
///
/// The claim, the settlement's writes and the event outcome commit together.
/// If `apply` fails the transaction rolls back, including the claim.
pub fn settle_once<F>(
    conn: &mut Connection,
    provider: &str,
    event_id: &str,
    event_type: &str,
    payload: &str,
    apply: F,
) -> Result<GateOutcome>
where
    F: FnOnce(&Connection) -> Result<Settlement>,
{
    // IMMEDIATE takes the write lock up front; concurrent deliveries queue on busy_timeout
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if !queries::try_record_webhook_event(&tx, provider, event_id, event_type, payload)? {
        return Ok(GateOutcome::AlreadyProcessed);
    }

    let settlement = apply(&tx)?;

    let (entity_id, outcome) = match &settlement {
        Settlement::Applied { entity_id } => (Some(entity_id.as_str()), EventOutcome::Applied),
        Settlement::Skipped(_) => (None, EventOutcome::Skipped),
    };
    queries::finish_webhook_event(&tx, provider, event_id, entity_id, outcome)?;

    tx.commit()?;

    Ok(GateOutcome::Settled(settlement))
}

fn resolve_account(conn: &Connection, account: &AccountRef) -> Result<Option<Account>> {
    if let Some(id) = &account.account_id {
        if let Some(found) = queries::get_account_by_id(conn, id)? {
            return Ok(Some(found));
        }
        tracing::warn!("Payment metadata references unknown account {}", id);
    }
    match &account.email {
        Some(email) => queries::get_account_by_email(conn, email),
        None => Ok(None),
    }
}

/// Create the order for a payment and grant the product's credits.
pub fn apply_payment(conn: &Connection, provider: &str, data: &PaymentData) -> Result<Settlement> {
    let Some(account) = resolve_account(conn, &data.account)? else {
        tracing::warn!(
            "{} payment {} has no matching account (metadata={:?}, email={:?})",
            provider,
            data.provider_order_id,
            data.account.account_id,
            data.account.email
        );
        return Ok(Settlement::Skipped("Account not found"));
    };

    let Some(product) = queries::get_product_by_id(conn, &data.product_id)? else {
        tracing::warn!("{} payment {} for unknown product {}", provider, data.provider_order_id, data.product_id);
        return Ok(Settlement::Skipped("Product not found"));
    };

    // A second event id for an order we already settled
    if queries::get_order_by_provider_order(conn, provider, &data.provider_order_id)?.is_some() {
        tracing::info!("{} order {} already settled", provider, data.provider_order_id);
        return Ok(Settlement::Skipped("Order already settled"));
    }

    // Every subscription period, including the first, is credited by its own
    // paid event. The checkout order grants nothing; it is kept so refunds
    // that reference it can be traced to the first period.
    let subscription_checkout =
        data.kind == OrderKind::Purchase && product.kind == ProductKind::Subscription;

    let parent_order_id = if data.kind == OrderKind::Renewal {
        queries::find_unlinked_subscription_checkout(conn, provider, &account.id, &product.id)?
            .map(|checkout| checkout.id)
    } else {
        None
    };

    let order = queries::create_order(
        conn,
        &CreateOrder {
            account_id: account.id.clone(),
            provider: provider.to_string(),
            provider_order_id: data.provider_order_id.clone(),
            product_id: Some(product.id.clone()),
            amount_cents: data.amount_cents,
            currency: data.currency.clone(),
            credits: if subscription_checkout { 0 } else { product.credits },
            kind: data.kind,
            parent_order_id,
            event_id: data.event_id.clone(),
        },
    )?;

    if subscription_checkout {
        let linked = queries::link_latest_renewal(conn, &order.id, provider, &account.id, &product.id)?;
        tracing::info!(
            "{} subscription checkout recorded: order={}, account={}, first period already paid={}",
            provider,
            order.id,
            account.id,
            linked
        );
        return Ok(Settlement::Applied { entity_id: order.id });
    }

    let reason = match data.kind {
        OrderKind::Renewal => LedgerReason::Renewal,
        _ => LedgerReason::Purchase,
    };
    let note = format!("{} {} ({})", product.name, data.kind.as_ref(), data.provider_order_id);
    let entry = queries::apply_credit_delta(
        conn,
        &account.id,
        product.credits,
        reason,
        Some(&note),
        Some(&data.event_id),
    )?;

    tracing::info!(
        "{} {} settled: order={}, account={}, credits=+{}, balance={}",
        provider,
        data.kind.as_ref(),
        order.id,
        account.id,
        product.credits,
        entry.balance_after
    );

    Ok(Settlement::Applied { entity_id: order.id })
}

/// Record a refund order and claw back the credits it covers.
///
/// Partial refunds claw back credits in proportion to the amount refunded.
/// The total clawed back never exceeds what the order granted, and the
/// ledger debit is capped at the current balance.
pub fn apply_refund(conn: &Connection, provider: &str, data: &RefundData) -> Result<Settlement> {
    let Some(original) = queries::get_order_by_provider_order(conn, provider, &data.original_order_id)? else {
        tracing::warn!(
            "No order found for {} refund {} (order {}) - refund cannot be linked",
            provider,
            data.refund_id,
            data.original_order_id
        );
        return Ok(Settlement::Skipped("Original order not found"));
    };

    if original.kind == OrderKind::Refund {
        return Ok(Settlement::Skipped("Cannot refund a refund"));
    }

    // A subscription checkout granted nothing itself; its first paid period did
    let original = if original.kind == OrderKind::Purchase && original.credits == 0 {
        match queries::get_first_period_of_checkout(conn, &original.id)? {
            Some(period) => period,
            None => {
                tracing::warn!(
                    "{} refund {} references subscription order {} with no paid period yet",
                    provider,
                    data.refund_id,
                    data.original_order_id
                );
                return Ok(Settlement::Skipped("Subscription period not settled"));
            }
        }
    } else {
        original
    };

    if queries::get_order_by_provider_order(conn, provider, &data.refund_id)?.is_some() {
        return Ok(Settlement::Skipped("Refund already settled"));
    }

    let Some(account) = queries::get_account_by_id(conn, &original.account_id)? else {
        return Ok(Settlement::Skipped("Account not found"));
    };

    let proportional = if original.amount_cents > 0 && data.amount_cents < original.amount_cents {
        original.credits * data.amount_cents.max(0) / original.amount_cents
    } else {
        original.credits
    };
    let remaining = original.credits - queries::sum_refunded_credits(conn, &original.id)?;
    let clawback = proportional.min(remaining).max(0);
    let debit = clawback.min(account.credits_balance);

    let order = queries::create_order(
        conn,
        &CreateOrder {
            account_id: account.id.clone(),
            provider: provider.to_string(),
            provider_order_id: data.refund_id.clone(),
            product_id: original.product_id.clone(),
            amount_cents: -data.amount_cents,
            currency: data.currency.clone(),
            credits: -clawback,
            kind: OrderKind::Refund,
            parent_order_id: Some(original.id.clone()),
            event_id: data.event_id.clone(),
        },
    )?;

    let note = if debit < clawback {
        format!(
            "Refund {} of order {}: clawback of {} capped at balance {}",
            data.refund_id, data.original_order_id, clawback, account.credits_balance
        )
    } else {
        format!("Refund {} of order {}", data.refund_id, data.original_order_id)
    };

    queries::apply_credit_delta(
        conn,
        &account.id,
        -debit,
        LedgerReason::Refund,
        Some(&note),
        Some(&data.event_id),
    )?;

    tracing::info!(
        "{} refund settled: refund={}, order={}, account={}, credits=-{}",
        provider,
        data.refund_id,
        original.id,
        account.id,
        debit
    );

    Ok(Settlement::Applied { entity_id: order.id })
}

/// Look up a task by the provider's prediction id, falling back to our own
/// task id from the webhook URL.
///
/// The fallback covers submissions whose outcome was unknown, so the
/// prediction id was never stored; the first webhook attaches it. An unknown
/// task is an error rather than a skip: the webhook can race the submission
/// that stores the id, so the claim must roll back and the provider's retry
/// gets another chance.
fn find_task(conn: &Connection, provider_task_id: &str, task_id: Option<&str>) -> Result<Task> {
    if let Some(task) = queries::get_task_by_provider_id(conn, provider_task_id)? {
        return Ok(task);
    }

    if let Some(id) = task_id {
        if let Some(task) = queries::get_task_by_id(conn, id)? {
            if queries::attach_provider_task_id(conn, &task.id, provider_task_id)? {
                tracing::info!("Task {} matched to prediction {} by webhook", task.id, provider_task_id);
                return Ok(Task {
                    provider_task_id: Some(provider_task_id.to_string()),
                    ..task
                });
            }
            tracing::warn!(
                "Webhook for prediction {} names task {}, which belongs to {:?}",
                provider_task_id,
                task.id,
                task.provider_task_id
            );
        }
    }

    tracing::warn!("Webhook for unknown task {}", provider_task_id);
    Err(AppError::NotFound(msg::TASK_NOT_FOUND.into()))
}

/// Finish a task successfully and store its outputs.
pub fn apply_task_completion(conn: &Connection, data: &TaskCompletionData) -> Result<Settlement> {
    let task = find_task(conn, &data.provider_task_id, data.task_id.as_deref())?;

    if !queries::try_finish_task(conn, &task.id, TaskStatus::Completed, None)? {
        tracing::warn!(
            "Completion for task {} ignored: already {}",
            task.id,
            task.status.as_ref()
        );
        return Ok(Settlement::Skipped("Task already finished"));
    }

    for (position, url) in data.outputs.iter().enumerate() {
        queries::create_task_output(conn, &task.id, url, position as i64, &data.event_id)?;
    }

    tracing::info!(
        "Task {} completed: provider_task={}, outputs={}",
        task.id,
        data.provider_task_id,
        data.outputs.len()
    );

    Ok(Settlement::Applied { entity_id: task.id })
}

/// Fail a task and refund its charge.
pub fn apply_task_failure(conn: &Connection, data: &TaskFailureData) -> Result<Settlement> {
    let task = find_task(conn, &data.provider_task_id, data.task_id.as_deref())?;

    if !fail_task_and_refund(conn, &task, &data.error, Some(&data.event_id))? {
        return Ok(Settlement::Skipped("Task already finished"));
    }

    Ok(Settlement::Applied { entity_id: task.id })
}

/// Move a task to `failed` and credit its cost back. Returns false (and
/// refunds nothing) if the task had already reached a terminal status.
///
/// Shared by the failure webhook and by submission failures.
pub fn fail_task_and_refund(
    conn: &Connection,
    task: &Task,
    error: &str,
    event_id: Option<&str>,
) -> Result<bool> {
    if !queries::try_finish_task(conn, &task.id, TaskStatus::Failed, Some(error))? {
        return Ok(false);
    }

    let note = format!("Refund for failed task {}", task.id);
    let entry = queries::apply_credit_delta(
        conn,
        &task.account_id,
        task.cost_credits,
        LedgerReason::TaskRefund,
        Some(&note),
        event_id,
    )?;

    tracing::info!(
        "Task {} failed ({}): refunded {} credits, balance={}",
        task.id,
        error,
        task.cost_credits,
        entry.balance_after
    );

    Ok(true)
}

/// Generic webhook handler that delegates to provider-specific implementations.
pub async fn handle_webhook<P: WebhookProvider>(
    provider: &P,
    state: &AppState,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    if let Err(e) = provider.verify_request(state, &headers, &body) {
        return e;
    }

    let event = match provider.parse_event(&headers, &body) {
        Ok(e) => e,
        Err(e) => return e,
    };

    let Some((event_id, event_type)) = event.key() else {
        return (StatusCode::OK, "Event ignored");
    };

    let mut conn = match state.db.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("DB connection error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    let name = provider.provider_name();
    let payload = String::from_utf8_lossy(&body);

    let outcome = settle_once(&mut conn, name, event_id, event_type, &payload, |tx| {
        match &event {
            WebhookEvent::Payment(data) => apply_payment(tx, name, data),
            WebhookEvent::Refund(data) => apply_refund(tx, name, data),
            WebhookEvent::TaskCompleted(data) => apply_task_completion(tx, data),
            WebhookEvent::TaskFailed(data) => apply_task_failure(tx, data),
            WebhookEvent::Ignored => Ok(Settlement::Skipped("Event ignored")),
        }
    });

    match outcome {
        Ok(GateOutcome::AlreadyProcessed) => {
            tracing::info!("{} event {} already processed", name, event_id);
            (StatusCode::OK, "Already processed")
        }
        Ok(GateOutcome::Settled(Settlement::Applied { .. })) => (StatusCode::OK, "OK"),
        Ok(GateOutcome::Settled(Settlement::Skipped(reason))) => {
            tracing::info!("{} event {} skipped: {}", name, event_id, reason);
            (StatusCode::OK, reason)
        }
        Err(AppError::NotFound(_)) => (StatusCode::NOT_FOUND, "Task not found"),
        // Unique constraint tripped by a concurrent delivery of the same order under another event id
        Err(AppError::Conflict(msg)) => {
            tracing::warn!("{} event {} conflicted: {}", name, event_id, msg);
            (StatusCode::OK, "Already processed")
        }
        Err(e) => {
            // Rolled back, including the claim: the provider's retry starts over
            tracing::error!("Failed to settle {} event {}: {}", name, event_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}
