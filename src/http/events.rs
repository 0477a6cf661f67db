//! `/ws/events` handler (design §4.9, §6): a persistent SSE stream that
//! forwards the change bus to an external subscriber. Despite the
//! route name (kept for parity with the donor's websocket-shaped
//! dashboards), transport here is SSE-style per design §4.9, not a raw
//! websocket upgrade.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::http::AppState;

pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let events = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(change) => serde_json::to_string(&change)
            .ok()
            .map(|json| Ok(Event::default().data(json))),
        // A lagged receiver just means slow subscribers dropped some
        // messages (design §4.9); skip the gap rather than erroring.
        Err(_) => None,
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
