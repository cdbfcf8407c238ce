// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lote rows: ingest inserts, processing updates, and carryover reads.

use crate::{StoreResult, col_enum, col_ts, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{Lote, LoteId, ParseStatus, RouteDayId, ShiftId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

pub(crate) fn map_lote(row: &SqliteRow) -> StoreResult<Lote> {
    Ok(Lote {
        id: row.try_get("id")?,
        imap_uidvalidity: row.try_get("imap_uidvalidity")?,
        imap_uid: row.try_get("imap_uid")?,
        received_at: col_ts(row, "received_at")?,
        subject_raw: row.try_get("subject_raw")?,
        body_raw: row.try_get("body_raw")?,
        parse_status: col_enum(row, "parse_status")?,
        parse_error: row.try_get("parse_error")?,
        route_day_id: row.try_get("route_day_id")?,
        products_catalog_version: row.try_get("products_catalog_version")?,
        routes_catalog_version: row.try_get("routes_catalog_version")?,
        shift_id: row.try_get("shift_id")?,
        carried_over: row.try_get::<i64, _>("carried_over")? != 0,
        created_at: col_ts(row, "created_at")?,
    })
}

/// A message materialized by the ingest worker.
#[derive(Debug, Clone)]
pub struct NewLote {
    /// Mailbox generation.
    pub uidvalidity: i64,
    /// Message UID within the generation.
    pub uid: i64,
    /// Ingest instant.
    pub received_at: DateTime<Utc>,
    /// Raw subject.
    pub subject_raw: String,
    /// Raw body.
    pub body_raw: String,
    /// The shift that was active at ingest.
    pub shift_id: ShiftId,
    /// `PENDING`, or `ERROR_PARSE` when extraction already failed.
    pub parse_status: ParseStatus,
    /// Extraction failure detail.
    pub parse_error: Option<String>,
}

/// Insert an ingested lote keyed by `(uidvalidity, uid)`. Returns `None`
/// when that pair already exists — the ingest idempotency anchor.
pub async fn insert_ingested(
    conn: &mut SqliteConnection,
    lote: &NewLote,
) -> StoreResult<Option<LoteId>> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO lotes
         (imap_uidvalidity, imap_uid, received_at, subject_raw, body_raw,
          parse_status, parse_error, shift_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(lote.uidvalidity)
    .bind(lote.uid)
    .bind(ts_to_sql(lote.received_at))
    .bind(&lote.subject_raw)
    .bind(&lote.body_raw)
    .bind(lote.parse_status.as_str())
    .bind(&lote.parse_error)
    .bind(lote.shift_id)
    .bind(ts_to_sql(lote.received_at))
    .execute(conn)
    .await?;
    if res.rows_affected() == 0 {
        Ok(None)
    } else {
        Ok(Some(res.last_insert_rowid()))
    }
}

/// Fetch one lote.
pub async fn get(conn: &mut SqliteConnection, id: LoteId) -> StoreResult<Option<Lote>> {
    let row = sqlx::query("SELECT * FROM lotes WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_lote).transpose()
}

/// Record the parse outcome.
pub async fn set_status(
    conn: &mut SqliteConnection,
    id: LoteId,
    status: ParseStatus,
    error: Option<&str>,
) -> StoreResult<()> {
    sqlx::query("UPDATE lotes SET parse_status = ?, parse_error = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Bind the catalog versions the lote was (or will be) processed under.
pub async fn bind_catalog_versions(
    conn: &mut SqliteConnection,
    id: LoteId,
    products_version: i64,
    routes_version: i64,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE lotes SET products_catalog_version = ?, routes_catalog_version = ? WHERE id = ?",
    )
    .bind(products_version)
    .bind(routes_version)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Attach the lote to its materialized route.
pub async fn set_route_day(
    conn: &mut SqliteConnection,
    id: LoteId,
    route_day_id: RouteDayId,
) -> StoreResult<()> {
    sqlx::query("UPDATE lotes SET route_day_id = ? WHERE id = ?")
        .bind(route_day_id)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Newest OK lote of a route, by the lote ordering `(created_at, id)`.
/// This is the cutoff captured at operator first-enter.
pub async fn latest_ok(
    conn: &mut SqliteConnection,
    route_day_id: RouteDayId,
) -> StoreResult<Option<LoteId>> {
    let id = sqlx::query_scalar(
        "SELECT id FROM lotes WHERE route_day_id = ? AND parse_status = 'OK'
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(route_day_id)
    .fetch_optional(conn)
    .await?;
    Ok(id)
}

/// Lotes of `shift_id` that still hold at least one unprinted line, in lote
/// order. The carryover source set.
pub async fn with_unprinted_lines(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
) -> StoreResult<Vec<Lote>> {
    let rows = sqlx::query(
        "SELECT DISTINCT l.* FROM lotes l
         JOIN client_orders c ON c.lote_id = l.id
         JOIN lines n ON n.client_order_id = c.id
         WHERE l.shift_id = ? AND l.parse_status = 'OK' AND n.printed_at IS NULL
         ORDER BY l.created_at, l.id",
    )
    .bind(shift_id)
    .fetch_all(conn)
    .await?;
    rows.iter().map(map_lote).collect()
}

/// Duplicate a source lote into a new shift as a carried-over lote. The
/// `(uidvalidity, uid)` identity stays behind with the original.
pub async fn insert_carryover(
    conn: &mut SqliteConnection,
    source: &Lote,
    new_shift: ShiftId,
    route_day_id: RouteDayId,
    now: DateTime<Utc>,
) -> StoreResult<LoteId> {
    let res = sqlx::query(
        "INSERT INTO lotes
         (received_at, subject_raw, body_raw, parse_status, route_day_id,
          products_catalog_version, routes_catalog_version, shift_id,
          carried_over, created_at)
         VALUES (?, ?, ?, 'OK', ?, ?, ?, ?, 1, ?)",
    )
    .bind(ts_to_sql(source.received_at))
    .bind(&source.subject_raw)
    .bind(&source.body_raw)
    .bind(route_day_id)
    .bind(source.products_catalog_version)
    .bind(source.routes_catalog_version)
    .bind(new_shift)
    .bind(ts_to_sql(now))
    .execute(conn)
    .await?;
    Ok(res.last_insert_rowid())
}
