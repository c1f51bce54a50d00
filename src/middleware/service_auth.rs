use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::db::AppState;
use crate::util::extract_bearer_token;

/// Require the shared service token on the accounts/tasks API.
///
/// The caller is the web front end, which authenticates end users itself.
pub async fn service_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer_token(request.headers()).ok_or(StatusCode::UNAUTHORIZED)?;

    if state.api_token.is_empty() {
        tracing::warn!("Rejecting API request: API_TOKEN is not configured");
        return Err(StatusCode::UNAUTHORIZED);
    }

    if !bool::from(token.as_bytes().ct_eq(state.api_token.as_bytes())) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
