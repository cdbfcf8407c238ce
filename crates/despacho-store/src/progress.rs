// SPDX-License-Identifier: MIT OR Apache-2.0
//! Print-progress bookkeeping: operator cutoff/last-printed rows and the
//! per-route collector cursor.

use crate::{StoreResult, col_ts, col_ts_opt, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{CollectorRouteProgress, LoteId, OperatorRouteProgress, ShiftId, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

fn map_operator(row: &SqliteRow) -> StoreResult<OperatorRouteProgress> {
    Ok(OperatorRouteProgress {
        shift_id: row.try_get("shift_id")?,
        operator_user: row.try_get("operator_user")?,
        route_norm: row.try_get("route_norm")?,
        entered_at: col_ts(row, "entered_at")?,
        cutoff_lote: row.try_get("cutoff_lote")?,
        last_printed_lote: row.try_get("last_printed_lote")?,
        last_printed_at: col_ts_opt(row, "last_printed_at")?,
    })
}

/// First-enter bookkeeping. Returns `true` when the row was created now;
/// re-entering is a no-op and the cutoff never advances.
pub async fn enter_operator(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    operator: UserId,
    route_norm: &str,
    cutoff_lote: Option<LoteId>,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO operator_route_progress
         (shift_id, operator_user, route_norm, entered_at, cutoff_lote)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(shift_id)
    .bind(operator)
    .bind(route_norm)
    .bind(ts_to_sql(now))
    .bind(cutoff_lote)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// The operator's progress row, if they entered the route this shift.
pub async fn operator_progress(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    operator: UserId,
    route_norm: &str,
) -> StoreResult<Option<OperatorRouteProgress>> {
    let row = sqlx::query(
        "SELECT * FROM operator_route_progress
         WHERE shift_id = ? AND operator_user = ? AND route_norm = ?",
    )
    .bind(shift_id)
    .bind(operator)
    .bind(route_norm)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(map_operator).transpose()
}

/// Advance `last_printed_lote` after a committed operator print.
pub async fn advance_operator_printed(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    operator: UserId,
    route_norm: &str,
    lote: LoteId,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE operator_route_progress
         SET last_printed_lote = ?, last_printed_at = ?
         WHERE shift_id = ? AND operator_user = ? AND route_norm = ?",
    )
    .bind(lote)
    .bind(ts_to_sql(now))
    .bind(shift_id)
    .bind(operator)
    .bind(route_norm)
    .execute(conn)
    .await?;
    Ok(())
}

/// The collector cursor for a route this shift, if one exists yet.
pub async fn collector_progress(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    route_norm: &str,
) -> StoreResult<Option<CollectorRouteProgress>> {
    let row = sqlx::query(
        "SELECT * FROM collector_route_progress WHERE shift_id = ? AND route_norm = ?",
    )
    .bind(shift_id)
    .bind(route_norm)
    .fetch_optional(conn)
    .await?;
    row.map(|row| {
        Ok(CollectorRouteProgress {
            shift_id: row.try_get("shift_id")?,
            route_norm: row.try_get("route_norm")?,
            last_closed_lote: row.try_get("last_closed_lote")?,
            last_closed_at: col_ts_opt(&row, "last_closed_at")?,
        })
    })
    .transpose()
}

/// Advance `last_closed_lote` after a committed collector print.
pub async fn advance_collector_closed(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    route_norm: &str,
    lote: LoteId,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO collector_route_progress (shift_id, route_norm, last_closed_lote, last_closed_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (shift_id, route_norm)
         DO UPDATE SET last_closed_lote = excluded.last_closed_lote,
                       last_closed_at = excluded.last_closed_at",
    )
    .bind(shift_id)
    .bind(route_norm)
    .bind(lote)
    .bind(ts_to_sql(now))
    .execute(conn)
    .await?;
    Ok(())
}
