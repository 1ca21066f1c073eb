//! Stripe webhook endpoint.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::state::AppState;

/// Receive a signed Stripe event.
///
/// Signature failures are rejected with 400 before any state is touched.
/// Handler failures are logged and acknowledged with 200 so Stripe does not
/// retry events we can never process (the idempotent claim lets genuinely
/// transient failures succeed on redelivery).
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!("Webhook request missing Stripe-Signature header");
        return StatusCode::BAD_REQUEST;
    };

    let event = match state.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected webhook with invalid signature");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(e) = state.webhooks.handle_event(event).await {
        tracing::error!(error = %e, "Webhook event processing failed");
    }

    StatusCode::OK
}
