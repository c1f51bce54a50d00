use chrono::Utc;
use rusqlite::{Connection, ffi, params};
use uuid::Uuid;

use crate::error::{AppError, Result, msg};
use crate::models::*;

use super::from_row::{
    ACCOUNT_COLS, LEDGER_COLS, ORDER_COLS, PRODUCT_COLS, TASK_COLS, TASK_OUTPUT_COLS,
    WEBHOOK_EVENT_COLS, query_all, query_one,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

/// UNIQUE or PRIMARY KEY collision only; CHECK, NOT NULL and FOREIGN KEY failures are real errors.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// ============ Accounts ============

/// Create an account and credit the signup bonus in the caller's transaction.
/// Emails are stored lowercased so lookups by customer email are case-insensitive.
pub fn create_account(conn: &Connection, input: &CreateAccount, signup_credits: i64) -> Result<Account> {
    let id = gen_id();
    let email = input.email.trim().to_lowercase();
    let now = now();

    conn.execute(
        "INSERT INTO accounts (id, email, credits_balance, created_at, updated_at) VALUES (?1, ?2, 0, ?3, ?3)",
        params![&id, &email, now],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::Conflict(msg::EMAIL_TAKEN.into())
        } else {
            e.into()
        }
    })?;

    if signup_credits > 0 {
        apply_credit_delta(
            conn,
            &id,
            signup_credits,
            LedgerReason::SignupBonus,
            Some("Signup bonus"),
            None,
        )?;
    }

    get_account_by_id(conn, &id)?
        .ok_or_else(|| AppError::Internal("account vanished after insert".into()))
}

pub fn get_account_by_id(conn: &Connection, id: &str) -> Result<Option<Account>> {
    query_one(
        conn,
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLS),
        &[&id],
    )
}

pub fn get_account_by_email(conn: &Connection, email: &str) -> Result<Option<Account>> {
    let email = email.trim().to_lowercase();
    query_one(
        conn,
        &format!("SELECT {} FROM accounts WHERE email = ?1", ACCOUNT_COLS),
        &[&email],
    )
}

pub fn count_accounts(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
        .map_err(Into::into)
}

// ============ Ledger ============

/// Apply a credit change to an account: update the cached balance and append
/// a ledger entry. Must run inside the caller's transaction so both writes
/// land together.
///
/// Fails with `InsufficientCredits` when the balance would drop below zero.
pub fn apply_credit_delta(
    conn: &Connection,
    account_id: &str,
    delta: i64,
    reason: LedgerReason,
    note: Option<&str>,
    event_id: Option<&str>,
) -> Result<LedgerEntry> {
    let now = now();

    // The balance guard lives in the WHERE clause so the check and the write are one statement
    let affected = conn.execute(
        "UPDATE accounts SET credits_balance = credits_balance + ?1, updated_at = ?2
         WHERE id = ?3 AND credits_balance + ?1 >= 0",
        params![delta, now, account_id],
    )?;

    if affected == 0 {
        return match get_account_by_id(conn, account_id)? {
            None => Err(AppError::NotFound(msg::ACCOUNT_NOT_FOUND.into())),
            Some(account) => Err(AppError::InsufficientCredits {
                balance: account.credits_balance,
                required: -delta,
            }),
        };
    }

    let balance_after: i64 = conn.query_row(
        "SELECT credits_balance FROM accounts WHERE id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;

    let entry = LedgerEntry {
        id: gen_id(),
        account_id: account_id.to_string(),
        delta,
        balance_after,
        reason,
        note: note.map(String::from),
        event_id: event_id.map(String::from),
        created_at: now,
    };

    conn.execute(
        "INSERT INTO ledger_entries (id, account_id, delta, balance_after, reason, note, event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &entry.id,
            &entry.account_id,
            entry.delta,
            entry.balance_after,
            entry.reason.as_ref(),
            &entry.note,
            &entry.event_id,
            entry.created_at,
        ],
    )?;

    Ok(entry)
}

/// Most recent ledger entries first.
pub fn list_ledger_entries(conn: &Connection, account_id: &str, limit: i64) -> Result<Vec<LedgerEntry>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM ledger_entries WHERE account_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            LEDGER_COLS
        ),
        &[&account_id, &limit],
    )
}

pub fn sum_ledger_deltas(conn: &Connection, account_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(delta), 0) FROM ledger_entries WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

// ============ Products ============

/// Insert or update a credit package (used by seeding and tests).
pub fn upsert_product(conn: &Connection, input: &CreateProduct) -> Result<Product> {
    conn.execute(
        "INSERT INTO products (id, name, credits, kind, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, credits = excluded.credits, kind = excluded.kind",
        params![&input.id, &input.name, input.credits, input.kind.as_ref(), now()],
    )?;

    get_product_by_id(conn, &input.id)?
        .ok_or_else(|| AppError::Internal("product vanished after upsert".into()))
}

pub fn get_product_by_id(conn: &Connection, id: &str) -> Result<Option<Product>> {
    query_one(
        conn,
        &format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLS),
        &[&id],
    )
}

// ============ Webhook Events ============

/// Try to claim a webhook event. Returns true if this delivery is the first
/// one (row inserted), false if the event was already recorded.
///
/// Call inside the settlement transaction: if settlement fails the claim
/// rolls back with it and the provider's retry is processed from scratch.
pub fn try_record_webhook_event(
    conn: &Connection,
    provider: &str,
    event_id: &str,
    event_type: &str,
    payload: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO webhook_events (provider, event_id, event_type, entity_id, payload, outcome, created_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
        params![provider, event_id, event_type, payload, EventOutcome::Pending.as_ref(), now()],
    )?;
    Ok(affected > 0)
}

/// Record what a claimed event settled into.
pub fn finish_webhook_event(
    conn: &Connection,
    provider: &str,
    event_id: &str,
    entity_id: Option<&str>,
    outcome: EventOutcome,
) -> Result<()> {
    conn.execute(
        "UPDATE webhook_events SET entity_id = ?1, outcome = ?2 WHERE provider = ?3 AND event_id = ?4",
        params![entity_id, outcome.as_ref(), provider, event_id],
    )?;
    Ok(())
}

pub fn get_webhook_event(
    conn: &Connection,
    provider: &str,
    event_id: &str,
) -> Result<Option<WebhookEventRecord>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM webhook_events WHERE provider = ?1 AND event_id = ?2",
            WEBHOOK_EVENT_COLS
        ),
        &[&provider, &event_id],
    )
}

/// Purge webhook events beyond the retention period.
/// Providers stop retrying after a few days, so old records no longer guard anything.
/// Returns the number of deleted records.
pub fn purge_old_webhook_events(conn: &Connection, retention_days: i64) -> Result<usize> {
    let cutoff = now() - (retention_days * 86400);
    let deleted = conn.execute(
        "DELETE FROM webhook_events WHERE created_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}

// ============ Orders ============

pub fn create_order(conn: &Connection, input: &CreateOrder) -> Result<Order> {
    let id = gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO orders (id, account_id, provider, provider_order_id, product_id, amount_cents, currency, credits, kind, parent_order_id, event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            &id,
            &input.account_id,
            &input.provider,
            &input.provider_order_id,
            &input.product_id,
            input.amount_cents,
            &input.currency,
            input.credits,
            input.kind.as_ref(),
            &input.parent_order_id,
            &input.event_id,
            now,
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::Conflict(format!(
                "order {} already exists for {}",
                input.provider_order_id, input.provider
            ))
        } else {
            e.into()
        }
    })?;

    Ok(Order {
        id,
        account_id: input.account_id.clone(),
        provider: input.provider.clone(),
        provider_order_id: input.provider_order_id.clone(),
        product_id: input.product_id.clone(),
        amount_cents: input.amount_cents,
        currency: input.currency.clone(),
        credits: input.credits,
        kind: input.kind,
        parent_order_id: input.parent_order_id.clone(),
        event_id: input.event_id.clone(),
        created_at: now,
    })
}

pub fn get_order_by_provider_order(
    conn: &Connection,
    provider: &str,
    provider_order_id: &str,
) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE provider = ?1 AND provider_order_id = ?2",
            ORDER_COLS
        ),
        &[&provider, &provider_order_id],
    )
}

/// Latest subscription checkout for this account and product whose first
/// paid period has not been linked to it yet.
pub fn find_unlinked_subscription_checkout(
    conn: &Connection,
    provider: &str,
    account_id: &str,
    product_id: &str,
) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders o
             WHERE o.provider = ?1 AND o.account_id = ?2 AND o.product_id = ?3
               AND o.kind = ?4 AND o.credits = 0
               AND NOT EXISTS (
                   SELECT 1 FROM orders r WHERE r.parent_order_id = o.id AND r.kind = ?5
               )
             ORDER BY o.created_at DESC, o.rowid DESC LIMIT 1",
            ORDER_COLS
        ),
        &[
            &provider,
            &account_id,
            &product_id,
            &OrderKind::Purchase.as_ref(),
            &OrderKind::Renewal.as_ref(),
        ],
    )
}

/// Link the latest unlinked renewal of a product to a subscription checkout
/// that arrived after its first paid period. Returns whether one was linked.
pub fn link_latest_renewal(
    conn: &Connection,
    checkout_order_id: &str,
    provider: &str,
    account_id: &str,
    product_id: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET parent_order_id = ?1
         WHERE id = (
             SELECT id FROM orders
             WHERE provider = ?2 AND account_id = ?3 AND product_id = ?4
               AND kind = ?5 AND parent_order_id IS NULL
             ORDER BY created_at DESC, rowid DESC LIMIT 1
         )",
        params![
            checkout_order_id,
            provider,
            account_id,
            product_id,
            OrderKind::Renewal.as_ref()
        ],
    )?;
    Ok(affected > 0)
}

/// The paid period that credited a subscription checkout.
pub fn get_first_period_of_checkout(conn: &Connection, checkout_order_id: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE parent_order_id = ?1 AND kind = ?2
             ORDER BY created_at, rowid LIMIT 1",
            ORDER_COLS
        ),
        &[&checkout_order_id, &OrderKind::Renewal.as_ref()],
    )
}

/// Credits already clawed back by refunds of an order (returned as a positive number).
pub fn sum_refunded_credits(conn: &Connection, parent_order_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(-SUM(credits), 0) FROM orders WHERE parent_order_id = ?1 AND kind = 'refund'",
        params![parent_order_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

// ============ Tasks ============

pub fn create_task(conn: &Connection, input: &CreateTask) -> Result<Task> {
    let id = gen_id();
    let now = now();
    let input_json = serde_json::to_string(&input.input)?;

    conn.execute(
        "INSERT INTO tasks (id, account_id, model, input, cost_credits, status, provider_task_id, error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?7)",
        params![
            &id,
            &input.account_id,
            input.model.trim(),
            &input_json,
            input.cost_credits,
            TaskStatus::Pending.as_ref(),
            now,
        ],
    )?;

    get_task_by_id(conn, &id)?.ok_or_else(|| AppError::Internal("task vanished after insert".into()))
}

pub fn get_task_by_id(conn: &Connection, id: &str) -> Result<Option<Task>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLS),
        &[&id],
    )
}

pub fn get_task_by_provider_id(conn: &Connection, provider_task_id: &str) -> Result<Option<Task>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tasks WHERE provider_task_id = ?1", TASK_COLS),
        &[&provider_task_id],
    )
}

/// Record the provider's prediction id and move a pending task to processing.
/// Returns false if the task was no longer pending.
pub fn set_task_submitted(conn: &Connection, id: &str, provider_task_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE tasks SET status = ?1, provider_task_id = ?2, updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            TaskStatus::Processing.as_ref(),
            provider_task_id,
            now(),
            id,
            TaskStatus::Pending.as_ref(),
        ],
    )?;
    Ok(affected > 0)
}

/// Store the prediction id on a task that has none yet, leaving its status alone.
pub fn attach_provider_task_id(conn: &Connection, id: &str, provider_task_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE tasks SET provider_task_id = ?1, updated_at = ?2
         WHERE id = ?3 AND provider_task_id IS NULL",
        params![provider_task_id, now(), id],
    )?;
    Ok(affected > 0)
}

/// Atomically move a non-terminal task into a terminal status.
/// Returns false if the task was already terminal (or does not exist).
pub fn try_finish_task(
    conn: &Connection,
    id: &str,
    status: TaskStatus,
    error: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let affected = conn.execute(
        "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3
         WHERE id = ?4 AND status IN ('pending', 'processing')",
        params![status.as_ref(), error, now(), id],
    )?;
    Ok(affected > 0)
}

pub fn create_task_output(
    conn: &Connection,
    task_id: &str,
    url: &str,
    position: i64,
    event_id: &str,
) -> Result<TaskOutput> {
    let output = TaskOutput {
        id: gen_id(),
        task_id: task_id.to_string(),
        url: url.to_string(),
        position,
        event_id: event_id.to_string(),
        created_at: now(),
    };

    conn.execute(
        "INSERT INTO task_outputs (id, task_id, url, position, event_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &output.id,
            &output.task_id,
            &output.url,
            output.position,
            &output.event_id,
            output.created_at,
        ],
    )?;

    Ok(output)
}

pub fn list_task_outputs(conn: &Connection, task_id: &str) -> Result<Vec<TaskOutput>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM task_outputs WHERE task_id = ?1 ORDER BY position",
            TASK_OUTPUT_COLS
        ),
        &[&task_id],
    )
}
