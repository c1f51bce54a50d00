pub mod accounts;
pub mod tasks;
pub mod webhooks;

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde::Serialize;

use crate::db::AppState;
use crate::middleware::service_auth;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn public_router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Accounts and tasks, behind the service token.
pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/{account_id}", get(accounts::get_account))
        .route("/tasks", post(tasks::create_task))
        .route("/tasks/{task_id}", get(tasks::get_task))
        .layer(middleware::from_fn_with_state(state, service_auth))
}

/// Every route the service exposes, without the tracing layer.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(public_router())
        .merge(webhooks::router())
        .merge(api_router(state.clone()))
        .with_state(state)
}
