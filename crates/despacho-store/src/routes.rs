// SPDX-License-Identifier: MIT OR Apache-2.0
//! RouteDay rows, the derived unprinted metric, wall-display summaries,
//! and collector bindings.

use crate::{StoreResult, col_enum, col_ts_opt, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{LogicalState, RouteDay, RouteDayId, RouteSummary, ShiftId, UserId, VisualState};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

fn map_route_day(row: &SqliteRow) -> StoreResult<RouteDay> {
    Ok(RouteDay {
        id: row.try_get("id")?,
        shift_id: row.try_get("shift_id")?,
        route_norm: row.try_get("route_norm")?,
        visual_state: col_enum(row, "visual_state")?,
        logical_state: col_enum(row, "logical_state")?,
        reactivations_count: row.try_get("reactivations_count")?,
        last_event_at: col_ts_opt(row, "last_event_at")?,
    })
}

/// Fetch a route day by id.
pub async fn get(conn: &mut SqliteConnection, id: RouteDayId) -> StoreResult<Option<RouteDay>> {
    let row = sqlx::query("SELECT * FROM route_days WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_route_day).transpose()
}

/// Fetch a route day by its `(shift, route)` key.
pub async fn find(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    route_norm: &str,
) -> StoreResult<Option<RouteDay>> {
    let row = sqlx::query("SELECT * FROM route_days WHERE shift_id = ? AND route_norm = ?")
        .bind(shift_id)
        .bind(route_norm)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_route_day).transpose()
}

/// Lazily materialize the `(shift, route)` row with the initial
/// `{BLUE, ACTIVE, 0}` state.
pub async fn find_or_create(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    route_norm: &str,
) -> StoreResult<RouteDay> {
    sqlx::query("INSERT OR IGNORE INTO route_days (shift_id, route_norm) VALUES (?, ?)")
        .bind(shift_id)
        .bind(route_norm)
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query("SELECT * FROM route_days WHERE shift_id = ? AND route_norm = ?")
        .bind(shift_id)
        .bind(route_norm)
        .fetch_one(&mut *conn)
        .await?;
    map_route_day(&row)
}

/// Write the derived visual state.
pub async fn set_visual(
    conn: &mut SqliteConnection,
    id: RouteDayId,
    visual: VisualState,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("UPDATE route_days SET visual_state = ?, last_event_at = ? WHERE id = ?")
        .bind(visual.as_str())
        .bind(ts_to_sql(at))
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Write the collector-driven logical state.
pub async fn set_logical(
    conn: &mut SqliteConnection,
    id: RouteDayId,
    logical: LogicalState,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("UPDATE route_days SET logical_state = ?, last_event_at = ? WHERE id = ?")
        .bind(logical.as_str())
        .bind(ts_to_sql(at))
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Count one promotion of a collected route out of GREEN.
pub async fn increment_reactivations(
    conn: &mut SqliteConnection,
    id: RouteDayId,
) -> StoreResult<()> {
    sqlx::query("UPDATE route_days SET reactivations_count = reactivations_count + 1 WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Lines not yet printed in this route, this shift. Only OK lotes hold
/// lines, so no status filter is needed beyond the join.
pub async fn unprinted_count(
    conn: &mut SqliteConnection,
    route_day_id: RouteDayId,
) -> StoreResult<i64> {
    let n = sqlx::query_scalar(
        "SELECT COUNT(*) FROM lines n
         JOIN client_orders c ON n.client_order_id = c.id
         JOIN lotes l ON c.lote_id = l.id
         WHERE l.route_day_id = ? AND l.parse_status = 'OK' AND n.printed_at IS NULL",
    )
    .bind(route_day_id)
    .fetch_one(conn)
    .await?;
    Ok(n)
}

/// Per-route aggregates for one shift, for the wall display.
pub async fn summaries(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
) -> StoreResult<Vec<RouteSummary>> {
    let rows = sqlx::query(
        "SELECT rd.id, rd.route_norm, rd.visual_state, rd.logical_state,
            (SELECT COUNT(*) FROM lines n
             JOIN client_orders c ON n.client_order_id = c.id
             JOIN lotes l ON c.lote_id = l.id
             WHERE l.route_day_id = rd.id AND l.parse_status = 'OK'
               AND n.printed_at IS NULL) AS unprinted,
            (SELECT COUNT(*) FROM lines n
             JOIN client_orders c ON n.client_order_id = c.id
             JOIN lotes l ON c.lote_id = l.id
             WHERE l.route_day_id = rd.id AND l.parse_status = 'OK') AS total_lines,
            (SELECT COUNT(*) FROM client_orders c
             JOIN lotes l ON c.lote_id = l.id
             WHERE l.route_day_id = rd.id AND l.parse_status = 'OK') AS total_clients,
            (SELECT COUNT(*) FROM lotes l WHERE l.route_day_id = rd.id) AS lotes_count
         FROM route_days rd WHERE rd.shift_id = ? ORDER BY rd.route_norm",
    )
    .bind(shift_id)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(RouteSummary {
                route_id: row.try_get("id")?,
                route_name: row.try_get("route_norm")?,
                visual_state: col_enum(row, "visual_state")?,
                logical_state: col_enum(row, "logical_state")?,
                unprinted: row.try_get("unprinted")?,
                total_lines: row.try_get("total_lines")?,
                total_clients: row.try_get("total_clients")?,
                lotes_count: row.try_get("lotes_count")?,
            })
        })
        .collect()
}

/// The collector bound to a route this shift, if any.
pub async fn collector_for(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    route_norm: &str,
) -> StoreResult<Option<UserId>> {
    let user = sqlx::query_scalar(
        "SELECT collector_user FROM route_collectors WHERE shift_id = ? AND route_norm = ?",
    )
    .bind(shift_id)
    .bind(route_norm)
    .fetch_optional(conn)
    .await?;
    Ok(user)
}

/// Bind (or rebind) a collector to a route for the shift.
pub async fn set_collector(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    route_norm: &str,
    collector: UserId,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO route_collectors (shift_id, route_norm, collector_user) VALUES (?, ?, ?)
         ON CONFLICT (shift_id, route_norm) DO UPDATE SET collector_user = excluded.collector_user",
    )
    .bind(shift_id)
    .bind(route_norm)
    .bind(collector)
    .execute(conn)
    .await?;
    Ok(())
}
