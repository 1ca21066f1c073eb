//! HTTP routes.

mod usage;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/api/usage/{user_id}", get(usage::get_usage))
        .route("/api/usage/consume", post(usage::consume))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}
