//! A/B test CRUD + lifecycle handlers (design §6, §4.8).

use std::collections::{BTreeMap, HashMap};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::http::{AppState, OrgContext};
use crate::models::ab_test::{AbTest, AbTestStatus, AbTestType, SignificanceSummary, WinnerMetric};
use crate::models::segment::SegmentPredicate;
use crate::models::tracking::TrackingEventKind;
use crate::models::{Recipient, Variant};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tests).post(create_test))
        .route("/:id", get(get_test))
        .route("/:id/start", post(start_test))
        .route("/:id/pause", post(pause_test))
        .route("/:id/resume", post(resume_test))
        .route("/:id/cancel", post(cancel_test))
        .route("/:id/select-winner", post(select_winner))
        .route("/:id/send-winner", post(send_winner))
        .route("/:id/significance", get(significance))
        .route("/:id/results", get(results))
        .route("/:id/timeline", get(timeline))
}

#[derive(Debug, Deserialize)]
pub struct CreateAbTestRequest {
    pub campaign: Option<Uuid>,
    pub test_type: AbTestType,
    pub sample_percent: u8,
    pub winner_metric: WinnerMetric,
    pub winner_wait_hours: i64,
    pub confidence_threshold: f64,
    pub min_sample: u32,
    pub variants: Vec<Variant>,
}

/// `POST /{id}/start` body: the audience to sample from, as either a
/// confirmed list or a compiled segment predicate (design §4.4, §4.8).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAudience {
    List(Uuid),
    Segment(SegmentPredicate),
}

#[derive(Debug, Deserialize)]
pub struct StartTestRequest {
    pub audience: StartAudience,
}

#[derive(Debug, Deserialize)]
pub struct SelectWinnerRequest {
    pub variant: Uuid,
}

async fn list_tests(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
) -> Result<Json<Vec<AbTest>>, AppError> {
    Ok(Json(state.gateway.list_ab_tests(org).await?))
}

async fn create_test(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Json(request): Json<CreateAbTestRequest>,
) -> Result<(StatusCode, Json<AbTest>), AppError> {
    if request.variants.len() < 2 {
        return Err(AppError::Validation("an a/b test needs at least two variants".into()));
    }
    if !request.variants.iter().any(|v| v.is_control) {
        return Err(AppError::Validation("exactly one variant must be marked as control".into()));
    }
    let test = AbTest {
        id: Uuid::new_v4(),
        org,
        campaign: request.campaign,
        test_type: request.test_type,
        sample_percent: request.sample_percent,
        winner_metric: request.winner_metric,
        winner_wait_hours: request.winner_wait_hours,
        confidence_threshold: request.confidence_threshold,
        min_sample: request.min_sample,
        status: AbTestStatus::Draft,
        variants: request.variants,
        winner_variant: None,
        audience_size: 0,
        test_sample_size: 0,
        started_at: None,
        created_at: chrono::Utc::now(),
    };
    if !test.split_percent_within_rounding_slack() {
        return Err(AppError::Validation("variant split percentages must sum to 100 within rounding slack".into()));
    }
    let test = state.gateway.upsert_ab_test(test).await?;
    Ok((StatusCode::CREATED, Json(test)))
}

async fn get_test(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<AbTest>, AppError> {
    Ok(Json(state.gateway.get_ab_test(org, id).await?))
}

async fn start_test(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
    Json(request): Json<StartTestRequest>,
) -> Result<Json<AbTest>, AppError> {
    let test = state.gateway.get_ab_test(org, id).await?;
    let eligible: Vec<Recipient> = match request.audience {
        StartAudience::List(list) => state.resolver.resolve_list(org, list).await?,
        StartAudience::Segment(predicate) => state.resolver.resolve_segment(org, &predicate).await?,
    };
    let test = state.ab_controller.start(test, eligible).await?;
    Ok(Json(test))
}

async fn pause_test(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<AbTest>, AppError> {
    let mut test = state.gateway.get_ab_test(org, id).await?;
    test.status = AbTestStatus::Paused;
    Ok(Json(state.gateway.upsert_ab_test(test).await?))
}

async fn resume_test(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<AbTest>, AppError> {
    let mut test = state.gateway.get_ab_test(org, id).await?;
    test.status = AbTestStatus::Testing;
    Ok(Json(state.gateway.upsert_ab_test(test).await?))
}

async fn cancel_test(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<AbTest>, AppError> {
    let mut test = state.gateway.get_ab_test(org, id).await?;
    test.status = AbTestStatus::Cancelled;
    Ok(Json(state.gateway.upsert_ab_test(test).await?))
}

async fn select_winner(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
    Json(request): Json<SelectWinnerRequest>,
) -> Result<Json<AbTest>, AppError> {
    let test = state.gateway.get_ab_test(org, id).await?;
    let test = state.ab_controller.select_winner_manual(test, request.variant).await?;
    Ok(Json(test))
}

/// `POST /{id}/send-winner` — promote the selected winner to the
/// remainder of the audience and dispatch it (design §4.8).
async fn send_winner(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let test = state.gateway.get_ab_test(org, id).await?;
    let campaign_id = test
        .campaign
        .ok_or_else(|| AppError::StateViolation(format!("ab_test {id} has no linked campaign")))?;
    let campaign = state.gateway.get_campaign(org, campaign_id).await?;
    let audience = state.dispatcher.recipients_for_campaign(&campaign).await?;

    let (test, winner, remainder) = state.ab_controller.promote_winner(test, audience).await?;

    let mut campaign = campaign;
    campaign.transition(crate::models::CampaignStatus::SendingWinner)?;
    let campaign = state.gateway.upsert_campaign(campaign).await?;

    let dispatcher = state.dispatcher.clone();
    let test_id = test.id;
    tokio::spawn(async move {
        if let Err(err) = dispatcher.send_winner(campaign, test_id, winner, remainder).await {
            tracing::error!(%err, "winner dispatch failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn significance(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<SignificanceSummary>>, AppError> {
    let test = state.gateway.get_ab_test(org, id).await?;
    let results = state.ab_controller.evaluate_significance(&test);
    Ok(Json(
        results
            .into_iter()
            .map(|(variant, result)| SignificanceSummary {
                variant,
                confidence: result.confidence,
                significant: result.significant,
                lift_vs_control: result.lift_vs_control,
            })
            .collect(),
    ))
}

/// `GET /{id}/results` response body: every variant's raw counters plus
/// the derived rates a dashboard would otherwise recompute client-side
/// (design §6, §4.8).
#[derive(Debug, Serialize)]
pub struct VariantResult {
    pub variant: Uuid,
    pub name: String,
    pub is_control: bool,
    pub is_winner: bool,
    pub sent: i64,
    pub delivered: i64,
    pub opens_unique: i64,
    pub clicks_unique: i64,
    pub bounces: i64,
    pub complaints: i64,
    pub conversions: i64,
    pub revenue: Decimal,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
    pub confidence_score: Option<f64>,
    pub lift_vs_control: Option<f64>,
    pub significant: bool,
}

impl From<&Variant> for VariantResult {
    fn from(variant: &Variant) -> Self {
        Self {
            variant: variant.id,
            name: variant.name.clone(),
            is_control: variant.is_control,
            is_winner: variant.is_winner,
            sent: variant.sent,
            delivered: variant.delivered,
            opens_unique: variant.opens_unique,
            clicks_unique: variant.clicks_unique,
            bounces: variant.bounces,
            complaints: variant.complaints,
            conversions: variant.conversions,
            revenue: variant.revenue,
            open_rate: variant.open_rate(),
            click_rate: variant.click_rate(),
            conversion_rate: variant.conversion_rate(),
            confidence_score: variant.confidence_score,
            lift_vs_control: variant.lift_vs_control,
            significant: variant.significant,
        }
    }
}

async fn results(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<VariantResult>>, AppError> {
    let test = state.gateway.get_ab_test(org, id).await?;
    Ok(Json(test.variants.iter().map(VariantResult::from).collect()))
}

/// One day's event counts for one variant (design §6 "`/timeline`").
#[derive(Debug, Serialize)]
pub struct TimelinePoint {
    pub date: NaiveDate,
    pub variant: Uuid,
    pub kind: TrackingEventKind,
    pub count: u64,
}

/// `GET /{id}/timeline` — per-day, per-variant event counts, built by
/// joining recorded tracking events back to the test's assignments
/// (design §4.7, §4.8). Events for recipients with no assignment (an
/// A/B test with no linked campaign, or a test that was never started)
/// are skipped rather than surfaced as an unattributed bucket.
async fn timeline(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TimelinePoint>>, AppError> {
    let test = state.gateway.get_ab_test(org, id).await?;
    let campaign = match test.campaign {
        Some(campaign) => campaign,
        None => return Ok(Json(Vec::new())),
    };

    let assignments = state.gateway.list_assignments(id).await?;
    let variant_by_recipient: HashMap<Uuid, Uuid> =
        assignments.iter().map(|a| (a.recipient, a.variant)).collect();
    let events = state.gateway.list_events(campaign).await?;

    let mut buckets: BTreeMap<(NaiveDate, Uuid, TrackingEventKind), u64> = BTreeMap::new();
    for event in &events {
        let Some(&variant) = variant_by_recipient.get(&event.recipient) else {
            continue;
        };
        let date = event.occurred_at.date_naive();
        *buckets.entry((date, variant, event.kind)).or_insert(0) += 1;
    }

    Ok(Json(
        buckets
            .into_iter()
            .map(|((date, variant, kind), count)| TimelinePoint { date, variant, kind, count })
            .collect(),
    ))
}
