//! Row mapping trait and helpers for reducing boilerplate in queries.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parse a TEXT column holding JSON.
fn parse_json(row: &Row, col: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const ACCOUNT_COLS: &str = "id, email, credits_balance, created_at, updated_at";

pub const LEDGER_COLS: &str =
    "id, account_id, delta, balance_after, reason, note, event_id, created_at";

pub const PRODUCT_COLS: &str = "id, name, credits, kind, created_at";

pub const WEBHOOK_EVENT_COLS: &str =
    "provider, event_id, event_type, entity_id, payload, outcome, created_at";

pub const ORDER_COLS: &str = "id, account_id, provider, provider_order_id, product_id, amount_cents, currency, credits, kind, parent_order_id, event_id, created_at";

pub const TASK_COLS: &str = "id, account_id, model, input, cost_credits, status, provider_task_id, error, created_at, updated_at";

pub const TASK_OUTPUT_COLS: &str = "id, task_id, url, position, event_id, created_at";

// ============ FromRow Implementations ============

impl FromRow for Account {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Account {
            id: row.get(0)?,
            email: row.get(1)?,
            credits_balance: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

impl FromRow for LedgerEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LedgerEntry {
            id: row.get(0)?,
            account_id: row.get(1)?,
            delta: row.get(2)?,
            balance_after: row.get(3)?,
            reason: parse_enum(row, 4, "reason")?,
            note: row.get(5)?,
            event_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl FromRow for Product {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Product {
            id: row.get(0)?,
            name: row.get(1)?,
            credits: row.get(2)?,
            kind: parse_enum(row, 3, "kind")?,
            created_at: row.get(4)?,
        })
    }
}

impl FromRow for WebhookEventRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(WebhookEventRecord {
            provider: row.get(0)?,
            event_id: row.get(1)?,
            event_type: row.get(2)?,
            entity_id: row.get(3)?,
            payload: row.get(4)?,
            outcome: parse_enum(row, 5, "outcome")?,
            created_at: row.get(6)?,
        })
    }
}

impl FromRow for Order {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get(0)?,
            account_id: row.get(1)?,
            provider: row.get(2)?,
            provider_order_id: row.get(3)?,
            product_id: row.get(4)?,
            amount_cents: row.get(5)?,
            currency: row.get(6)?,
            credits: row.get(7)?,
            kind: parse_enum(row, 8, "kind")?,
            parent_order_id: row.get(9)?,
            event_id: row.get(10)?,
            created_at: row.get(11)?,
        })
    }
}

impl FromRow for Task {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Task {
            id: row.get(0)?,
            account_id: row.get(1)?,
            model: row.get(2)?,
            input: parse_json(row, 3)?,
            cost_credits: row.get(4)?,
            status: parse_enum(row, 5, "status")?,
            provider_task_id: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

impl FromRow for TaskOutput {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TaskOutput {
            id: row.get(0)?,
            task_id: row.get(1)?,
            url: row.get(2)?,
            position: row.get(3)?,
            event_id: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}
