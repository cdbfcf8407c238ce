// SPDX-License-Identifier: MIT OR Apache-2.0
//! The append-only event log. Rows are never updated; timestamps are
//! assigned here, at append, so subscriber order matches log order.

use crate::{StoreResult, col_ts, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{EventDraft, EventId, EventRecord};
use sqlx::{Row, SqliteConnection};
use sqlx::sqlite::SqliteRow;

/// Replay cap for one SSE connection.
pub const REPLAY_CAP: i64 = 100;

fn map_event(row: &SqliteRow) -> StoreResult<EventRecord> {
    let payload_raw: String = row.try_get("payload")?;
    Ok(EventRecord {
        id: row.try_get("id")?,
        ts: col_ts(row, "ts")?,
        actor: row.try_get("actor")?,
        event_type: row.try_get("type")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        payload: serde_json::from_str(&payload_raw)?,
    })
}

/// Append one event; the timestamp is assigned here.
pub async fn append(conn: &mut SqliteConnection, draft: &EventDraft) -> StoreResult<EventRecord> {
    let ts = Utc::now();
    let payload = serde_json::to_string(&draft.payload)?;
    let res = sqlx::query(
        "INSERT INTO events (ts, actor, type, entity_type, entity_id, payload)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(ts_to_sql(ts))
    .bind(draft.actor)
    .bind(draft.event_type.as_str())
    .bind(draft.entity_type)
    .bind(&draft.entity_id)
    .bind(&payload)
    .execute(conn)
    .await?;
    Ok(EventRecord {
        id: res.last_insert_rowid(),
        ts,
        actor: draft.actor,
        event_type: draft.event_type.as_str().to_string(),
        entity_type: draft.entity_type.to_string(),
        entity_id: draft.entity_id.clone(),
        payload: draft.payload.clone(),
    })
}

/// Reference point for SSE replay (`Last-Event-ID`: timestamp or id).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventCursor {
    /// No reference; nothing is replayed.
    None,
    /// Replay events with `ts` strictly later.
    Ts(DateTime<Utc>),
    /// Replay events with `id` strictly greater.
    Id(EventId),
}

/// Events strictly later than the cursor, ascending, capped.
pub async fn replay(
    conn: &mut SqliteConnection,
    cursor: EventCursor,
    cap: i64,
) -> StoreResult<Vec<EventRecord>> {
    let rows = match cursor {
        EventCursor::None => return Ok(Vec::new()),
        EventCursor::Ts(ts) => {
            sqlx::query("SELECT * FROM events WHERE ts > ? ORDER BY ts, id LIMIT ?")
                .bind(ts_to_sql(ts))
                .bind(cap)
                .fetch_all(conn)
                .await?
        }
        EventCursor::Id(id) => {
            sqlx::query("SELECT * FROM events WHERE id > ? ORDER BY id LIMIT ?")
                .bind(id)
                .bind(cap)
                .fetch_all(conn)
                .await?
        }
    };
    rows.iter().map(map_event).collect()
}

/// Filters for the paged history endpoint.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Restrict to one entity kind.
    pub entity_type: Option<String>,
    /// Restrict to one entity.
    pub entity_id: Option<String>,
    /// Exclusive upper bound for descending pagination.
    pub before_id: Option<EventId>,
    /// Page size.
    pub limit: i64,
}

/// Newest-first page of the log.
pub async fn page(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
) -> StoreResult<Vec<EventRecord>> {
    let mut sql = String::from("SELECT * FROM events WHERE 1 = 1");
    if filter.event_type.is_some() {
        sql.push_str(" AND type = ?");
    }
    if filter.entity_type.is_some() {
        sql.push_str(" AND entity_type = ?");
    }
    if filter.entity_id.is_some() {
        sql.push_str(" AND entity_id = ?");
    }
    if filter.before_id.is_some() {
        sql.push_str(" AND id < ?");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(t) = &filter.event_type {
        query = query.bind(t);
    }
    if let Some(t) = &filter.entity_type {
        query = query.bind(t);
    }
    if let Some(t) = &filter.entity_id {
        query = query.bind(t);
    }
    if let Some(id) = filter.before_id {
        query = query.bind(id);
    }
    query = query.bind(filter.limit.clamp(1, 200));

    let rows = query.fetch_all(conn).await?;
    rows.iter().map(map_event).collect()
}
