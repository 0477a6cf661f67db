//! Throttle introspection and override handlers (design §6, §4.3).

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::http::{AppState, OrgContext};
use crate::models::{ThrottleCounters, ThrottleLimits, ThrottleScope};
use crate::services::throttle::{AutoAdjustConfig, DeliveryHealth};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config", get(config))
        .route("/stats", get(global_stats))
        .route("/isps", get(isp_limits))
        .route("/domain/:domain/limit", put(set_domain_limit))
        .route("/domain/:domain/stats", get(domain_stats))
        .route("/domain/:domain/backpressure", post(apply_backpressure))
        .route("/isp/:isp/limit", put(set_isp_limit))
        .route("/auto-adjust", post(auto_adjust))
}

#[derive(Debug, Deserialize)]
pub struct SetLimitRequest {
    pub hourly: u32,
    pub daily: u32,
    pub burst: u32,
}

#[derive(Debug, Deserialize)]
pub struct BackpressureRequest {
    pub seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct AutoAdjustRequest {
    pub scope: ThrottleScopeRequest,
    pub health: DeliveryHealthRequest,
    #[serde(default)]
    pub config: Option<AutoAdjustConfigRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ThrottleScopeRequest {
    Global,
    Isp(String),
    Domain(String),
}

#[derive(Debug, Deserialize)]
pub struct DeliveryHealthRequest {
    pub delivered: u64,
    pub bounced: u64,
    pub complaints: u64,
}

#[derive(Debug, Deserialize)]
pub struct AutoAdjustConfigRequest {
    pub healthy_bounce_ratio: f64,
    pub unhealthy_bounce_ratio: f64,
    pub raise_step: f64,
    pub lower_step: f64,
}

#[derive(Debug, Serialize)]
pub struct ThrottleStatsResponse {
    #[serde(flatten)]
    pub counters: ThrottleCounters,
}

/// `GET /config` response body: the default limits plus every active
/// override, so a dashboard can render the whole throttle posture in
/// one call (design §6 "`/throttle/{config|stats|isps}`").
#[derive(Debug, Serialize)]
pub struct ThrottleConfigResponse {
    pub default_limits: ThrottleLimits,
    pub domain_overrides: std::collections::HashMap<String, ThrottleLimits>,
    pub isp_overrides: std::collections::HashMap<String, ThrottleLimits>,
}

async fn config(State(state): State<AppState>, OrgContext(_org): OrgContext) -> Json<ThrottleConfigResponse> {
    Json(ThrottleConfigResponse {
        default_limits: state.throttle.default_limits(),
        domain_overrides: state.throttle.domain_overrides(),
        isp_overrides: state.throttle.isp_overrides(),
    })
}

/// `GET /isps` — the ISP-keyed limit overrides alone (design §6).
async fn isp_limits(
    State(state): State<AppState>,
    OrgContext(_org): OrgContext,
) -> Json<std::collections::HashMap<String, ThrottleLimits>> {
    Json(state.throttle.isp_overrides())
}

async fn global_stats(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
) -> Json<ThrottleStatsResponse> {
    let counters = state.throttle.snapshot(org, ThrottleScope::Global);
    Json(ThrottleStatsResponse { counters })
}

async fn domain_stats(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(domain): Path<String>,
) -> Json<ThrottleStatsResponse> {
    let counters = state.throttle.snapshot(org, ThrottleScope::Domain(domain.to_lowercase()));
    Json(ThrottleStatsResponse { counters })
}

async fn set_domain_limit(
    State(state): State<AppState>,
    OrgContext(_org): OrgContext,
    Path(domain): Path<String>,
    Json(request): Json<SetLimitRequest>,
) -> Result<(), AppError> {
    state.throttle.set_domain_limit(
        domain.to_lowercase(),
        ThrottleLimits {
            hourly: request.hourly,
            daily: request.daily,
            burst: request.burst,
        },
    );
    Ok(())
}

async fn set_isp_limit(
    State(state): State<AppState>,
    OrgContext(_org): OrgContext,
    Path(isp): Path<String>,
    Json(request): Json<SetLimitRequest>,
) -> Result<(), AppError> {
    state.throttle.set_isp_limit(
        isp.to_lowercase(),
        ThrottleLimits {
            hourly: request.hourly,
            daily: request.daily,
            burst: request.burst,
        },
    );
    Ok(())
}

async fn apply_backpressure(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Path(domain): Path<String>,
    Json(request): Json<BackpressureRequest>,
) -> Result<(), AppError> {
    state.throttle.apply_backpressure(org, &domain, request.seconds);
    Ok(())
}

async fn auto_adjust(
    State(state): State<AppState>,
    OrgContext(org): OrgContext,
    Json(request): Json<AutoAdjustRequest>,
) -> Result<(), AppError> {
    let scope = match request.scope {
        ThrottleScopeRequest::Global => ThrottleScope::Global,
        ThrottleScopeRequest::Isp(isp) => ThrottleScope::Isp(isp.to_lowercase()),
        ThrottleScopeRequest::Domain(domain) => ThrottleScope::Domain(domain.to_lowercase()),
    };
    let key = crate::models::ThrottleKey { org, scope };
    let health = DeliveryHealth {
        delivered: request.health.delivered,
        bounced: request.health.bounced,
        complaints: request.health.complaints,
    };
    let config = request
        .config
        .map(|c| AutoAdjustConfig {
            healthy_bounce_ratio: c.healthy_bounce_ratio,
            unhealthy_bounce_ratio: c.unhealthy_bounce_ratio,
            raise_step: c.raise_step,
            lower_step: c.lower_step,
        })
        .unwrap_or_default();
    state.throttle.auto_adjust(&key, health, config);
    Ok(())
}
