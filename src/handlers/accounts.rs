use axum::{extract::State, http::StatusCode};
use rusqlite::TransactionBehavior;

use crate::db::{AppState, queries};
use crate::error::{OptionExt, Result, msg};
use crate::extractors::{Json, Path};
use crate::models::{AccountWithLedger, CreateAccount};

/// Ledger entries returned alongside an account
const RECENT_LEDGER_LIMIT: i64 = 50;

pub async fn create_account(
    State(state): State<AppState>,
    Json(input): Json<CreateAccount>,
) -> Result<(StatusCode, Json<AccountWithLedger>)> {
    input.validate()?;

    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let account = queries::create_account(&tx, &input, state.signup_credits)?;
    let ledger = queries::list_ledger_entries(&tx, &account.id, RECENT_LEDGER_LIMIT)?;
    tx.commit()?;

    tracing::info!(
        "Account created: id={}, signup_credits={}",
        account.id,
        state.signup_credits
    );

    Ok((StatusCode::CREATED, Json(AccountWithLedger { account, ledger })))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountWithLedger>> {
    let conn = state.db.get()?;
    let account = queries::get_account_by_id(&conn, &account_id)?.or_not_found(msg::ACCOUNT_NOT_FOUND)?;
    let ledger = queries::list_ledger_entries(&conn, &account.id, RECENT_LEDGER_LIMIT)?;

    Ok(Json(AccountWithLedger { account, ledger }))
}
