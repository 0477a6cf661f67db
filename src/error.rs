//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds in the design's §7 table. HTTP handlers map
//! each variant to the documented status code; delivery/tracking errors
//! never reach this type directly (they are recorded as events instead,
//! see `delivery::DeliveryError` and `tracking`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("missing organization context")]
    AuthMissing,

    #[error("storage unavailable")]
    Storage(#[from] sqlx::Error),

    #[error("configuration invalid: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::StateViolation(_) => "state_violation",
            Self::AuthMissing => "auth_missing",
            Self::Storage(_) => "internal",
            Self::Config(_) => "internal",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StateViolation(_) => StatusCode::CONFLICT,
            Self::AuthMissing => StatusCode::UNAUTHORIZED,
            Self::Storage(_) | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            let request_id = Uuid::new_v4();
            tracing::error!(%request_id, error = %self, "internal error");
            json!({ "error": "internal", "request_id": request_id })
        } else {
            json!({ "error": self.kind(), "message": self.to_string() })
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
