//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use reelkit_ledger::LedgerError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, upgrade_required) = match &self {
            // Expected business outcome: payment required, caller shows an
            // upgrade prompt and does not retry.
            ApiError::Ledger(LedgerError::InsufficientCredits(kind)) => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                format!("Not enough {} credits remaining", kind),
                true,
            ),
            ApiError::Ledger(LedgerError::WebhookSignatureInvalid) => (
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                "Webhook signature verification failed".to_string(),
                false,
            ),
            ApiError::Ledger(LedgerError::UserNotFound) => (
                StatusCode::NOT_FOUND,
                "user_not_found",
                "User not found".to_string(),
                false,
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
                false,
            ),
            ApiError::Ledger(e) => {
                tracing::error!(error = %e, "Unhandled ledger error in request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                    false,
                )
            }
        };

        let body = serde_json::json!({
            "error": code,
            "message": message,
            "upgrade_required": upgrade_required,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelkit_ledger::CreditKind;

    #[test]
    fn test_insufficient_credits_is_payment_required() {
        let response =
            ApiError::Ledger(LedgerError::InsufficientCredits(CreditKind::Slide)).into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_bad_signature_is_client_error() {
        let response = ApiError::Ledger(LedgerError::WebhookSignatureInvalid).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_database_errors_are_opaque() {
        let response = ApiError::Ledger(LedgerError::Internal("boom".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
