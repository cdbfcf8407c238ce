// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `text/event-stream` endpoint: replay persisted events strictly
//! later than `Last-Event-ID`, then tail the live bus.
//!
//! The live subscription is attached before the replay snapshot is read,
//! and live events at or below the replay high-water mark are dropped, so
//! every event reaches the subscriber exactly once.

use crate::{ApiError, AppState};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use chrono::{DateTime, SecondsFormat, Utc};
use despacho_core::EventRecord;
use despacho_store::events::{self, EventCursor, REPLAY_CAP};
use futures::Stream;
use futures::stream::{self, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;

/// Keep-alive comment period.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Frame one event: `id:` is the timestamp, the event name is the fixed
/// `evento`, the data is the JSON record.
fn frame(record: &EventRecord) -> SseEvent {
    let data = serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .id(record.ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .event("evento")
        .data(data)
}

/// Parse `Last-Event-ID`: an event id or an ISO timestamp.
fn parse_last_event_id(headers: &HeaderMap) -> EventCursor {
    let Some(raw) = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    else {
        return EventCursor::None;
    };
    if raw.is_empty() {
        return EventCursor::None;
    }
    if let Ok(id) = raw.parse::<i64>() {
        return EventCursor::Id(id);
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => EventCursor::Ts(ts.with_timezone(&Utc)),
        Err(_) => EventCursor::None,
    }
}

/// `GET /api/events/stream`.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let cursor = parse_last_event_id(&headers);

    // Subscribe before reading the snapshot so nothing falls between
    // replay and tail; the id watermark deduplicates the overlap.
    let live_rx = state.bus.subscribe();
    let mut conn = state
        .store
        .pool()
        .acquire()
        .await
        .map_err(despacho_store::StoreError::from)?;
    let replayed = events::replay(&mut conn, cursor, REPLAY_CAP).await?;
    drop(conn);
    let watermark = replayed.last().map(|e| e.id).unwrap_or(match cursor {
        EventCursor::Id(id) => id,
        _ => 0,
    });

    let replay_stream = stream::iter(
        replayed
            .iter()
            .map(|record| Ok::<_, Infallible>(frame(record)))
            .collect::<Vec<_>>(),
    );
    let live_stream = BroadcastStream::new(live_rx).filter_map(move |item| async move {
        match item {
            Ok(record) if record.id > watermark => Some(Ok(frame(&record))),
            // Dropped on lag or a duplicate of the replay set; the log
            // still has it for the next reconnect.
            _ => None,
        }
    });

    Ok(Sse::new(replay_stream.chain(live_stream)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_PERIOD)
            .text("keepalive"),
    ))
}
