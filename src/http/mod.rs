//! HTTP surface (design §6) — axum router and shared application state.
//!
//! Mirrors the donor's `handlers::*` module layout, with the
//! `State(app_state): State<AppState>` extractor the donor left
//! commented out wired for real (design SPEC_FULL "HTTP surface").

pub mod ab_tests;
pub mod campaigns;
pub mod events;
pub mod suppressions;
pub mod throttle;
pub mod tracking;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::delivery::TransportRegistry;
use crate::error::AppError;
use crate::gateway::PersistenceGateway;
use crate::services::{AbController, Dispatcher, EventBus, RecipientResolver, SuppressionIndex, ThrottleCore, TrackingIngest, UrlSigner};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub suppression: Arc<SuppressionIndex>,
    pub throttle: Arc<ThrottleCore>,
    pub resolver: Arc<RecipientResolver>,
    pub transports: Arc<TransportRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub ab_controller: Arc<AbController>,
    pub tracking: Arc<TrackingIngest>,
    pub events: Arc<EventBus>,
    pub signer: Arc<UrlSigner>,
}

/// Org context resolved from the `X-Org-Id` header, or `DEFAULT_ORG_ID`
/// when dev mode permits it (design §6 "auth_missing -> 401").
pub struct OrgContext(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for OrgContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(header) = parts.headers.get("x-org-id") {
            let raw = header.to_str().map_err(|_| AppError::AuthMissing)?;
            let org = Uuid::parse_str(raw).map_err(|_| AppError::AuthMissing)?;
            return Ok(OrgContext(org));
        }
        state.config.default_org().map(OrgContext).ok_or(AppError::AuthMissing)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/mailing/campaigns", campaigns::router())
        .nest("/api/mailing/ab-tests", ab_tests::router())
        .nest("/api/mailing/throttle", throttle::router())
        .nest("/api/mailing/suppressions", suppressions::router())
        .nest("/track", tracking::router())
        .route("/ws/events", get(events::stream))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
