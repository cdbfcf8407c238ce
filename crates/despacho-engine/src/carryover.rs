// SPDX-License-Identifier: MIT OR Apache-2.0
//! Carryover: a freshly opened shift starts with every unprinted line of
//! the previous shift already present in its queues.
//!
//! Operator bindings are copied verbatim for continuity, even when the
//! operator is no longer qualified in the new shift; reassignment happens
//! only for brand-new lotes.

use chrono::{DateTime, Utc};
use despacho_bus::TxnEvents;
use despacho_core::{EventDraft, EventType, RouteDayId, ShiftId};
use despacho_store::{StoreResult, lotes, orders, routes, shifts};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::info;

/// What one carryover run produced.
#[derive(Debug, Default)]
pub struct CarryoverStats {
    /// Carried-over lote rows created.
    pub lotes: usize,
    /// Line rows copied.
    pub lines: usize,
    /// Route days touched in the new shift, for post-commit state sync.
    pub route_days: Vec<RouteDayId>,
}

/// Copy the unprinted remainder of the most recent CLOSED shift into
/// `new_shift`. Runs on the open-shift transaction.
pub async fn run(
    conn: &mut SqliteConnection,
    events: &mut TxnEvents,
    new_shift: ShiftId,
    now: DateTime<Utc>,
) -> StoreResult<CarryoverStats> {
    let mut stats = CarryoverStats::default();
    let Some(prev) = shifts::latest_closed(conn).await? else {
        return Ok(stats);
    };

    for source in lotes::with_unprinted_lines(conn, prev.id).await? {
        let Some(source_rd_id) = source.route_day_id else {
            continue;
        };
        let Some(source_rd) = routes::get(conn, source_rd_id).await? else {
            continue;
        };

        let rd = routes::find_or_create(conn, new_shift, &source_rd.route_norm).await?;
        let new_lote = lotes::insert_carryover(conn, &source, new_shift, rd.id, now).await?;
        if !stats.route_days.contains(&rd.id) {
            stats.route_days.push(rd.id);
        }

        let mut copied = 0usize;
        for client in orders::clients_of_lote(conn, source.id).await? {
            let unprinted: Vec<_> = orders::lines_of_client(conn, client.id)
                .await?
                .into_iter()
                .filter(|line| line.printed_at.is_none())
                .collect();
            if unprinted.is_empty() {
                continue;
            }

            let new_client = orders::insert_client_order(
                conn,
                new_lote,
                &client.name_raw,
                &client.affinity_key,
                client.observations.as_deref(),
            )
            .await?;
            for line in unprinted {
                orders::insert_line(
                    conn,
                    &orders::NewLine {
                        client_order_id: new_client,
                        seq_in_client: line.seq_in_client,
                        quantity: line.quantity,
                        unit_raw: line.unit_raw,
                        product_raw: line.product_raw,
                        product_norm: line.product_norm,
                        price: line.price,
                        currency: line.currency,
                        match_method: line.match_method,
                        match_score: line.match_score,
                        family: line.family,
                        functional_code: line.functional_code,
                        operator_user: line.operator_user,
                        assigned_at: line.assigned_at,
                    },
                )
                .await?;
                copied += 1;
            }
        }

        events
            .append(
                conn,
                &EventDraft::new(EventType::LoteCarriedOver, "lote", new_lote).payload(json!({
                    "source_lote": source.id,
                    "new_lote": new_lote,
                    "route": source_rd.route_norm,
                    "lines": copied,
                })),
            )
            .await?;
        stats.lotes += 1;
        stats.lines += copied;
    }

    if stats.lotes > 0 {
        info!(
            from_shift = prev.id,
            to_shift = new_shift,
            lotes = stats.lotes,
            lines = stats.lines,
            "carryover complete"
        );
    }
    Ok(stats)
}
