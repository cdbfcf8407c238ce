// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client orders and lines: inserts from the batch processor, the line
//! selector queries behind the print engine, and print stamping.
//!
//! Line ordering everywhere is lote `(created_at, id)`, then client id,
//! then `seq_in_client`.

use crate::{StoreResult, col_decimal, col_decimal_opt, col_enum_opt, col_ts_opt, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{
    ClientOrder, ClientOrderId, Line, LineId, LoteId, MatchMethod, RouteDayId, UserId,
};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

pub(crate) fn map_line(row: &SqliteRow) -> StoreResult<Line> {
    Ok(Line {
        id: row.try_get("id")?,
        client_order_id: row.try_get("client_order_id")?,
        seq_in_client: row.try_get("seq_in_client")?,
        quantity: col_decimal(row, "quantity")?,
        unit_raw: row.try_get("unit_raw")?,
        product_raw: row.try_get("product_raw")?,
        product_norm: row.try_get("product_norm")?,
        price: col_decimal_opt(row, "price")?,
        currency: row.try_get("currency")?,
        match_method: col_enum_opt(row, "match_method")?,
        match_score: row.try_get("match_score")?,
        family: row.try_get("family")?,
        functional_code: row.try_get("functional_code")?,
        operator_user: row.try_get("operator_user")?,
        assigned_at: col_ts_opt(row, "assigned_at")?,
        printed_at: col_ts_opt(row, "printed_at")?,
        print_count: row.try_get("print_count")?,
    })
}

fn map_client(row: &SqliteRow) -> StoreResult<ClientOrder> {
    Ok(ClientOrder {
        id: row.try_get("id")?,
        lote_id: row.try_get("lote_id")?,
        name_raw: row.try_get("name_raw")?,
        affinity_key: row.try_get("affinity_key")?,
        observations: row.try_get("observations")?,
    })
}

/// Insert one client order.
pub async fn insert_client_order(
    conn: &mut SqliteConnection,
    lote_id: LoteId,
    name_raw: &str,
    affinity_key: &str,
    observations: Option<&str>,
) -> StoreResult<ClientOrderId> {
    let res = sqlx::query(
        "INSERT INTO client_orders (lote_id, name_raw, affinity_key, observations)
         VALUES (?, ?, ?, ?)",
    )
    .bind(lote_id)
    .bind(name_raw)
    .bind(affinity_key)
    .bind(observations)
    .execute(conn)
    .await?;
    Ok(res.last_insert_rowid())
}

/// A line about to be inserted by the batch processor or the carryover.
#[derive(Debug, Clone)]
pub struct NewLine {
    /// Owning client order.
    pub client_order_id: ClientOrderId,
    /// Position within the client order.
    pub seq_in_client: i64,
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Unit as written.
    pub unit_raw: String,
    /// Product as written.
    pub product_raw: String,
    /// Normalized product name.
    pub product_norm: String,
    /// Unit price.
    pub price: Option<Decimal>,
    /// Price currency.
    pub currency: String,
    /// Match method, when the product resolved.
    pub match_method: Option<MatchMethod>,
    /// Match score in `[0, 1]`.
    pub match_score: Option<f64>,
    /// Product family.
    pub family: i64,
    /// Functional code.
    pub functional_code: i64,
    /// Assigned operator.
    pub operator_user: Option<UserId>,
    /// Assignment instant.
    pub assigned_at: Option<DateTime<Utc>>,
}

/// Insert one line with `print_count = 0`.
pub async fn insert_line(conn: &mut SqliteConnection, line: &NewLine) -> StoreResult<LineId> {
    let res = sqlx::query(
        "INSERT INTO lines
         (client_order_id, seq_in_client, quantity, unit_raw, product_raw, product_norm,
          price, currency, match_method, match_score, family, functional_code,
          operator_user, assigned_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(line.client_order_id)
    .bind(line.seq_in_client)
    .bind(line.quantity.to_string())
    .bind(&line.unit_raw)
    .bind(&line.product_raw)
    .bind(&line.product_norm)
    .bind(line.price.map(|p| p.to_string()))
    .bind(&line.currency)
    .bind(line.match_method.map(|m| m.as_str()))
    .bind(line.match_score)
    .bind(line.family)
    .bind(line.functional_code)
    .bind(line.operator_user)
    .bind(crate::ts_opt_to_sql(line.assigned_at))
    .execute(conn)
    .await?;
    Ok(res.last_insert_rowid())
}

/// Client orders of a lote, in insertion order.
pub async fn clients_of_lote(
    conn: &mut SqliteConnection,
    lote_id: LoteId,
) -> StoreResult<Vec<ClientOrder>> {
    let rows = sqlx::query("SELECT * FROM client_orders WHERE lote_id = ? ORDER BY id")
        .bind(lote_id)
        .fetch_all(conn)
        .await?;
    rows.iter().map(map_client).collect()
}

/// Lines of one client order, in sequence order.
pub async fn lines_of_client(
    conn: &mut SqliteConnection,
    client_order_id: ClientOrderId,
) -> StoreResult<Vec<Line>> {
    let rows = sqlx::query("SELECT * FROM lines WHERE client_order_id = ? ORDER BY seq_in_client")
        .bind(client_order_id)
        .fetch_all(conn)
        .await?;
    rows.iter().map(map_line).collect()
}

/// One selectable line together with its print-document context.
#[derive(Debug, Clone)]
pub struct SelectedLine {
    /// The line itself.
    pub line: Line,
    /// The lote it arrived in.
    pub lote_id: LoteId,
    /// Client name for the comanda section header.
    pub client_name: String,
    /// Client observations for the comanda section header.
    pub client_observations: Option<String>,
}

pub(crate) fn map_selected(row: &SqliteRow) -> StoreResult<SelectedLine> {
    Ok(SelectedLine {
        line: map_line(row)?,
        lote_id: row.try_get("sel_lote_id")?,
        client_name: row.try_get("sel_client_name")?,
        client_observations: row.try_get("sel_client_observations")?,
    })
}

pub(crate) const SELECT_BASE: &str = "SELECT n.*, c.lote_id AS sel_lote_id, c.name_raw AS sel_client_name,
        c.observations AS sel_client_observations
     FROM lines n
     JOIN client_orders c ON n.client_order_id = c.id
     JOIN lotes l ON c.lote_id = l.id";

pub(crate) const SELECT_ORDER: &str = " ORDER BY l.created_at, l.id, c.id, n.seq_in_client";

/// Operator initial snapshot: the operator's lines in lotes at or before
/// the cutoff position.
pub async fn select_operator_initial(
    conn: &mut SqliteConnection,
    route_day_id: RouteDayId,
    operator: UserId,
    cutoff_lote: LoteId,
) -> StoreResult<Vec<SelectedLine>> {
    let sql = format!(
        "{SELECT_BASE}
         JOIN lotes cut ON cut.id = ?
         WHERE l.route_day_id = ? AND l.parse_status = 'OK' AND n.operator_user = ?
           AND (l.created_at < cut.created_at
                OR (l.created_at = cut.created_at AND l.id <= cut.id)){SELECT_ORDER}"
    );
    let rows = sqlx::query(&sql)
        .bind(cutoff_lote)
        .bind(route_day_id)
        .bind(operator)
        .fetch_all(conn)
        .await?;
    rows.iter().map(map_selected).collect()
}

/// Operator increment: the operator's lines in lotes strictly after
/// `after` (all of them when `after` is `None`).
pub async fn select_operator_new(
    conn: &mut SqliteConnection,
    route_day_id: RouteDayId,
    operator: UserId,
    after: Option<LoteId>,
) -> StoreResult<Vec<SelectedLine>> {
    let rows = match after {
        Some(after_lote) => {
            let sql = format!(
                "{SELECT_BASE}
                 JOIN lotes aft ON aft.id = ?
                 WHERE l.route_day_id = ? AND l.parse_status = 'OK' AND n.operator_user = ?
                   AND (l.created_at > aft.created_at
                        OR (l.created_at = aft.created_at AND l.id > aft.id)){SELECT_ORDER}"
            );
            sqlx::query(&sql)
                .bind(after_lote)
                .bind(route_day_id)
                .bind(operator)
                .fetch_all(conn)
                .await?
        }
        None => {
            let sql = format!(
                "{SELECT_BASE}
                 WHERE l.route_day_id = ? AND l.parse_status = 'OK'
                   AND n.operator_user = ?{SELECT_ORDER}"
            );
            sqlx::query(&sql)
                .bind(route_day_id)
                .bind(operator)
                .fetch_all(conn)
                .await?
        }
    };
    rows.iter().map(map_selected).collect()
}

/// Collector increment: every line in the route strictly after `after`
/// (all of them when `after` is `None`). No operator filter.
pub async fn select_collector_new(
    conn: &mut SqliteConnection,
    route_day_id: RouteDayId,
    after: Option<LoteId>,
) -> StoreResult<Vec<SelectedLine>> {
    let rows = match after {
        Some(after_lote) => {
            let sql = format!(
                "{SELECT_BASE}
                 JOIN lotes aft ON aft.id = ?
                 WHERE l.route_day_id = ? AND l.parse_status = 'OK'
                   AND (l.created_at > aft.created_at
                        OR (l.created_at = aft.created_at AND l.id > aft.id)){SELECT_ORDER}"
            );
            sqlx::query(&sql)
                .bind(after_lote)
                .bind(route_day_id)
                .fetch_all(conn)
                .await?
        }
        None => {
            let sql = format!(
                "{SELECT_BASE} WHERE l.route_day_id = ? AND l.parse_status = 'OK'{SELECT_ORDER}"
            );
            sqlx::query(&sql).bind(route_day_id).fetch_all(conn).await?
        }
    };
    rows.iter().map(map_selected).collect()
}

/// Stamp a successful print commit: first print sets `printed_at`, every
/// print increments `print_count`.
pub async fn stamp_printed(
    conn: &mut SqliteConnection,
    line_ids: &[LineId],
    now: DateTime<Utc>,
) -> StoreResult<()> {
    for id in line_ids {
        sqlx::query(
            "UPDATE lines SET print_count = print_count + 1,
             printed_at = COALESCE(printed_at, ?) WHERE id = ?",
        )
        .bind(ts_to_sql(now))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
