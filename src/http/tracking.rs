//! Tracking pixel/click beacon handlers (design §6, §4.7).
//!
//! Any verification failure gets the same neutral response as a
//! successful hit — a 1x1 pixel or a best-effort redirect — so a probe
//! can't distinguish a bad signature from a dead campaign (design §7).

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;

use crate::http::AppState;
use crate::services::tracking::TrackingError;

const TRANSPARENT_PIXEL: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/open/*segment", get(open))
        .route("/click/*segment", get(click))
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
}

async fn open(State(state): State<AppState>, Path(segment): Path<String>, headers: HeaderMap) -> Response {
    match state.tracking.record_open(&segment, user_agent(&headers)).await {
        Ok(_) | Err(TrackingError::InvalidSignature) | Err(TrackingError::NotFound) => pixel_response(),
    }
}

async fn click(State(state): State<AppState>, Path(segment): Path<String>, headers: HeaderMap) -> Response {
    match state.tracking.record_click(&segment, user_agent(&headers)).await {
        Ok(outcome) => match outcome.redirect_to {
            Some(target) => Redirect::temporary(&target).into_response(),
            None => pixel_response(),
        },
        Err(_) => pixel_response(),
    }
}

fn pixel_response() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/gif")],
        TRANSPARENT_PIXEL,
    )
        .into_response()
}
