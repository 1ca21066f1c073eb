//! Usage query and consumption endpoints.
//!
//! Internal API for feature code (slideshow posting, avatar generation, AI
//! outlines). A 402 response is terminal: the caller prompts the user to
//! upgrade and must not retry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use reelkit_ledger::{CreditKind, UsageLimits};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn get_usage(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UsageLimits>, ApiError> {
    let limits = state.consumption.get_usage_limits(user_id).await?;
    Ok(Json(limits))
}

fn default_cost() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
    pub kind: CreditKind,
    #[serde(default = "default_cost")]
    pub cost: i32,
}

pub async fn consume(
    State(state): State<AppState>,
    Json(request): Json<ConsumeRequest>,
) -> Result<StatusCode, ApiError> {
    if request.cost < 1 {
        return Err(ApiError::BadRequest("cost must be at least 1".to_string()));
    }

    state
        .consumption
        .consume(request.user_id, request.kind, request.cost)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_request_defaults_cost_to_one() {
        let request: ConsumeRequest = serde_json::from_str(
            r#"{"user_id":"6a2f41a3-c54c-4280-938f-81d87ed51c9a","kind":"slide"}"#,
        )
        .unwrap();
        assert_eq!(request.cost, 1);
        assert_eq!(request.kind, CreditKind::Slide);
    }

    #[test]
    fn test_consume_request_rejects_unknown_kind() {
        let result = serde_json::from_str::<ConsumeRequest>(
            r#"{"user_id":"6a2f41a3-c54c-4280-938f-81d87ed51c9a","kind":"video"}"#,
        );
        assert!(result.is_err());
    }
}
