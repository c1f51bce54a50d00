pub mod common;
pub mod creem;
pub mod wavespeed;

pub use creem::handle_creem_webhook;
pub use wavespeed::handle_wavespeed_webhook;

use axum::{Router, routing::post};

use crate::db::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/creem", post(handle_creem_webhook))
        .route("/webhook/wavespeed", post(handle_wavespeed_webhook))
}
