//! Suppression list handlers (design §6, §4.2).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::AppError;
use crate::http::{AppState, OrgContext};
use crate::models::{SuppressionEntry, SuppressionReason, SuppressionScope};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_suppressions).post(add_suppression))
        .route("/:scope/:value", delete(remove_suppression))
}

#[derive(Debug, Deserialize)]
pub struct AddSuppressionRequest {
    pub scope: SuppressionScope,
    pub value: String,
    pub reason: SuppressionReason,
}

async fn list_suppressions(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
) -> Result<Json<Vec<SuppressionEntry>>, AppError> {
    Ok(Json(state.gateway.list_suppressions(org).await?))
}

async fn add_suppression(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Json(request): Json<AddSuppressionRequest>,
) -> Result<(StatusCode, Json<SuppressionEntry>), AppError> {
    let entry = state
        .suppression
        .add(org, request.scope, &request.value, request.reason, "api")
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_suppression(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path((scope, value)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let scope = match scope.as_str() {
        "email" => SuppressionScope::Email,
        "domain" => SuppressionScope::Domain,
        other => return Err(AppError::Validation(format!("unknown suppression scope {other}"))),
    };
    state.suppression.remove(org, scope, &value).await?;
    Ok(StatusCode::NO_CONTENT)
}
