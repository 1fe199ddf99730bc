//! Server-Sent Events stream of run events.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use storyloop::events::RunEvent;

use crate::routes::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    from: Option<u64>,
}

/// First sequence to send: `?from=` wins, then `Last-Event-ID` + 1, then 0.
fn start_sequence(query: &EventsQuery, headers: &HeaderMap) -> u64 {
    if let Some(from) = query.from {
        return from;
    }
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(0, |last| last + 1)
}

fn to_frame(event: &RunEvent) -> Result<Event, axum::Error> {
    Event::default()
        .event(event.payload.kind())
        .id(event.sequence.to_string())
        .json_data(event)
}

/// GET /api/runs/{run_id}/events - one frame per event, `id` = sequence.
///
/// Streams stay open for registered runs and end after replay for archived ones.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let from = start_sequence(&query, &headers);
    debug!(run_id = %run_id, from, "sse subscriber attached");
    let events = state.orchestrator.subscribe_events(&run_id, from).await?;
    let stream = events.map(|event| to_frame(&event));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn explicit_from_overrides_last_event_id() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", HeaderValue::from_static("7"));
        assert_eq!(start_sequence(&EventsQuery { from: Some(2) }, &headers), 2);
        assert_eq!(start_sequence(&EventsQuery::default(), &headers), 8);
        assert_eq!(start_sequence(&EventsQuery::default(), &HeaderMap::new()), 0);
    }
}
