use axum::{extract::State, http::StatusCode};
use rusqlite::TransactionBehavior;

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{Json, Path};
use crate::generation::SubmitError;
use crate::handlers::webhooks::common::fail_task_and_refund;
use crate::models::{CreateTask, LedgerReason, Task, TaskWithOutputs};

const SUBMISSION_FAILED: &str = "Submission to provider failed";

/// Charge the account, create the task, and hand it to WaveSpeed.
///
/// The charge and the pending task commit together before the provider is
/// called. If the provider rejects the task or cannot be reached, the task
/// is failed and the charge refunded in one transaction. If the outcome is
/// unknown the task stays pending and charged; the webhook URL carries our
/// task id so the provider's result can still settle it.
pub async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<CreateTask>,
) -> Result<(StatusCode, Json<Task>)> {
    input.validate()?;

    if !state.wavespeed.is_configured() {
        return Err(AppError::Internal("WaveSpeed webhook secret not configured".into()));
    }

    let task = {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        queries::get_account_by_id(&tx, &input.account_id)?.or_not_found(msg::ACCOUNT_NOT_FOUND)?;

        let task = queries::create_task(&tx, &input)?;
        let note = format!("Charge for task {}", task.id);
        queries::apply_credit_delta(
            &tx,
            &task.account_id,
            -task.cost_credits,
            LedgerReason::TaskCharge,
            Some(&note),
            None,
        )?;
        tx.commit()?;
        task
    };

    let webhook_url = format!(
        "{}/webhook/wavespeed?task_id={}",
        state.base_url.trim_end_matches('/'),
        task.id
    );

    match state
        .wavespeed
        .submit_task(&task.model, &task.input, &webhook_url)
        .await
    {
        Ok(prediction_id) => {
            tracing::info!(
                "Task {} submitted: model={}, prediction={}, cost={}",
                task.id,
                task.model,
                prediction_id,
                task.cost_credits
            );
            let task = record_submission(&state, task, &prediction_id);
            Ok((StatusCode::ACCEPTED, Json(task)))
        }
        Err(SubmitError::Unknown(detail)) => {
            tracing::warn!(
                "Task {} submission outcome unknown, left pending for its webhook: {}",
                task.id,
                detail
            );
            Ok((StatusCode::ACCEPTED, Json(task)))
        }
        Err(e @ SubmitError::Rejected(_)) => {
            let mut conn = state.db.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            fail_task_and_refund(&tx, &task, SUBMISSION_FAILED, None)?;
            tx.commit()?;
            Err(e.into())
        }
    }
}

/// Store the prediction id after the provider accepted the task.
///
/// The provider already runs the task, so a local failure here must not turn
/// into an error response; the webhook finds the task by the id in its URL.
fn record_submission(state: &AppState, task: Task, prediction_id: &str) -> Task {
    let stored = state.db.get().map_err(AppError::from).and_then(|conn| {
        if !queries::set_task_submitted(&conn, &task.id, prediction_id)? {
            tracing::warn!("Task {} left pending before submission was recorded", task.id);
        }
        queries::get_task_by_id(&conn, &task.id)
    });

    match stored {
        Ok(Some(current)) => current,
        Ok(None) => task,
        Err(e) => {
            tracing::error!(
                "Task {} accepted as prediction {} but not recorded: {}",
                task.id,
                prediction_id,
                e
            );
            task
        }
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskWithOutputs>> {
    let conn = state.db.get()?;
    let task = queries::get_task_by_id(&conn, &task_id)?.or_not_found(msg::TASK_NOT_FOUND)?;
    let outputs = queries::list_task_outputs(&conn, &task.id)?;

    Ok(Json(TaskWithOutputs { task, outputs }))
}
