//! Campaign CRUD + lifecycle handlers (design §6).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::http::{AppState, OrgContext};
use crate::models::{Campaign, CampaignAudience, CampaignContent, CampaignStatus};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_campaigns).post(create_campaign))
        .route("/:id", get(get_campaign))
        .route("/:id/send", post(send_campaign))
        .route("/:id/pause", post(pause_campaign))
        .route("/:id/resume", post(resume_campaign))
        .route("/:id/cancel", post(cancel_campaign))
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub audience: CampaignAudience,
    pub content: CampaignContent,
}

#[derive(Debug, Serialize)]
pub struct CampaignResponse {
    #[serde(flatten)]
    pub campaign: Campaign,
}

async fn list_campaigns(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
) -> Result<Json<Vec<Campaign>>, AppError> {
    Ok(Json(state.gateway.list_campaigns(org).await?))
}

async fn create_campaign(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), AppError> {
    if request.content.subject.trim().is_empty() {
        return Err(AppError::Validation("subject must not be empty".into()));
    }
    let campaign = Campaign::new(org, request.audience, request.content);
    let campaign = state.gateway.upsert_campaign(campaign).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn get_campaign(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, AppError> {
    Ok(Json(state.gateway.get_campaign(org, id).await?))
}

/// `POST /{id}/send` — move `draft|scheduled -> sending` and drive the
/// dispatch loop on a background task (design §4.6, §6).
async fn send_campaign(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let mut campaign = state.gateway.get_campaign(org, id).await?;
    if campaign.status == CampaignStatus::Draft {
        campaign.transition(CampaignStatus::Scheduled)?;
        campaign = state.gateway.upsert_campaign(campaign).await?;
    }
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(err) = dispatcher.send_campaign(campaign).await {
            tracing::error!(%err, "campaign dispatch failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn pause_campaign(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, AppError> {
    let mut campaign = state.gateway.get_campaign(org, id).await?;
    campaign.transition(CampaignStatus::Paused)?;
    Ok(Json(state.gateway.upsert_campaign(campaign).await?))
}

async fn resume_campaign(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let mut campaign = state.gateway.get_campaign(org, id).await?;
    campaign.transition(CampaignStatus::Sending)?;
    campaign = state.gateway.upsert_campaign(campaign).await?;
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(err) = dispatcher.send_campaign(campaign).await {
            tracing::error!(%err, "campaign dispatch failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn cancel_campaign(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, AppError> {
    let mut campaign = state.gateway.get_campaign(org, id).await?;
    campaign.transition(CampaignStatus::Cancelled)?;
    state.dispatcher.cancel(campaign.id);
    Ok(Json(state.gateway.upsert_campaign(campaign).await?))
}
