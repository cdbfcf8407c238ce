// SPDX-License-Identifier: MIT OR Apache-2.0
//! The batch processor: one lote goes through parse → match → assign in a
//! single transaction, then the route color is recomputed.

use crate::{EngineError, route_state};
use chrono::Utc;
use despacho_bus::{EventBus, TxnEvents};
use despacho_core::{
    EventDraft, EventType, FAMILY_OTHERS, LoteId, MatchMethod, ParseStatus, RouteDayId,
};
use despacho_match::MatchOutcome;
use despacho_norm::norm;
use despacho_parser as parser;
use despacho_store::{Store, catalogs, lotes, orders, routes, shifts};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{info, warn};

/// Default line currency; the body grammar carries no currency marker.
const LINE_CURRENCY: &str = "EUR";

/// Orchestrates the processing of single lotes.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    store: Store,
    bus: EventBus,
    fuzzy_threshold: f64,
}

impl BatchProcessor {
    /// Build a processor over the shared store and bus.
    pub fn new(store: Store, bus: EventBus, fuzzy_threshold: f64) -> Self {
        Self {
            store,
            bus,
            fuzzy_threshold,
        }
    }

    /// Process one lote. Idempotent: an already-OK lote is a no-op; ERROR
    /// lotes may be retried (e.g. after a catalog fix). All writes commit
    /// atomically; the route-state step runs after the commit.
    pub async fn process_lote(&self, lote_id: LoteId) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await.map_err(EngineError::Store)?;
        let mut events = TxnEvents::new();

        let outcome = self.run(&mut tx, &mut events, lote_id).await;
        match outcome {
            Ok(route_day) => {
                tx.commit().await.map_err(despacho_store::StoreError::from)?;
                events.flush(&self.bus);
                if let Some(route_day_id) = route_day {
                    route_state::sync_route_state(&self.store, &self.bus, route_day_id).await?;
                }
                Ok(())
            }
            Err(err) => {
                // Roll back the partial work, then record the failure on
                // the lote so a human can retry it.
                drop(tx);
                warn!(lote_id, error = %err, "lote processing failed");
                if let EngineError::NotFound { .. } = err {
                    return Err(err);
                }
                let mut conn = self
                    .store
                    .pool()
                    .acquire()
                    .await
                    .map_err(despacho_store::StoreError::from)?;
                lotes::set_status(
                    &mut conn,
                    lote_id,
                    ParseStatus::ErrorParse,
                    Some(&err.to_string()),
                )
                .await?;
                self.bus
                    .publish(
                        &mut conn,
                        &EventDraft::new(EventType::LoteProcessError, "lote", lote_id)
                            .payload(json!({ "error": err.to_string() })),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// The in-transaction pipeline. `Ok(Some(route_day))` means the route
    /// color must be recomputed after commit; `Ok(None)` means the lote
    /// landed in a terminal error state that was committed normally.
    async fn run(
        &self,
        conn: &mut SqliteConnection,
        events: &mut TxnEvents,
        lote_id: LoteId,
    ) -> Result<Option<RouteDayId>, EngineError> {
        let lote = lotes::get(conn, lote_id)
            .await?
            .ok_or(EngineError::NotFound {
                what: "lote",
                id: lote_id,
            })?;
        if lote.parse_status == ParseStatus::Ok {
            return Ok(None);
        }

        let Some(shift) = shifts::find_active(conn).await? else {
            lotes::set_status(conn, lote_id, ParseStatus::ErrorParse, Some("no active shift"))
                .await?;
            events
                .append(
                    conn,
                    &EventDraft::new(EventType::LoteProcessError, "lote", lote_id)
                        .payload(json!({ "error": "no active shift" })),
                )
                .await?;
            return Ok(None);
        };

        // Snapshot the catalog versions the lote is processed under.
        let Some(products_version) = catalogs::active_products_version(conn).await? else {
            lotes::set_status(
                conn,
                lote_id,
                ParseStatus::ErrorParse,
                Some("no active products catalog"),
            )
            .await?;
            events
                .append(
                    conn,
                    &EventDraft::new(EventType::LoteProcessError, "lote", lote_id)
                        .payload(json!({ "error": "no active products catalog" })),
                )
                .await?;
            return Ok(None);
        };
        let Some(routes_version) = catalogs::active_routes_version(conn).await? else {
            lotes::set_status(
                conn,
                lote_id,
                ParseStatus::ErrorParse,
                Some("no active routes catalog"),
            )
            .await?;
            events
                .append(
                    conn,
                    &EventDraft::new(EventType::LoteProcessError, "lote", lote_id)
                        .payload(json!({ "error": "no active routes catalog" })),
                )
                .await?;
            return Ok(None);
        };
        lotes::bind_catalog_versions(conn, lote_id, products_version, routes_version).await?;

        let route_names = catalogs::route_names(conn, routes_version).await?;
        let route_norm = match parser::parse_subject(
            &lote.subject_raw,
            route_names.iter().map(String::as_str),
        ) {
            Ok(route) => route,
            Err(key) => {
                lotes::set_status(conn, lote_id, ParseStatus::ErrorRoute, Some("unknown route"))
                    .await?;
                events
                    .append(
                        conn,
                        &EventDraft::new(EventType::RouteParseError, "lote", lote_id)
                            .payload(json!({ "route_norm": key, "subject": lote.subject_raw })),
                    )
                    .await?;
                return Ok(None);
            }
        };

        let route_day = routes::find_or_create(conn, shift.id, &route_norm).await?;
        lotes::set_route_day(conn, lote_id, route_day.id).await?;

        let parse = parser::parse_body(&lote.body_raw);
        if !parse.is_success() {
            lotes::set_status(conn, lote_id, ParseStatus::ErrorParse, Some("unparseable body"))
                .await?;
            events
                .append(
                    conn,
                    &EventDraft::new(EventType::BodyParseError, "lote", lote_id)
                        .payload(json!({ "issues": parse.issues })),
                )
                .await?;
            // No line was created, so the route metric is untouched.
            return Ok(None);
        }

        let catalog = catalogs::products_for(conn, products_version).await?;
        let now = Utc::now();
        let mut line_count = 0usize;
        for client in &parse.clients {
            let affinity_key = norm(&client.name);
            let client_id = orders::insert_client_order(
                conn,
                lote_id,
                &client.name,
                &affinity_key,
                client.observations.as_deref(),
            )
            .await?;

            for (idx, line) in client.lines.iter().enumerate() {
                let product_norm = norm(&line.product_raw);
                let matched = despacho_match::match_product(
                    &line.product_raw,
                    &catalog,
                    self.fuzzy_threshold,
                );
                let (family, match_method, match_score) = match &matched {
                    MatchOutcome::Exact { family, .. } => {
                        (*family, Some(MatchMethod::Exact), Some(1.0))
                    }
                    MatchOutcome::Fuzzy { family, score, .. } => {
                        events
                            .append(
                                conn,
                                &EventDraft::new(EventType::ProductFuzzyMatch, "lote", lote_id)
                                    .payload(json!({
                                        "product_raw": line.product_raw,
                                        "score": score,
                                    })),
                            )
                            .await?;
                        (*family, Some(MatchMethod::Fuzzy), Some(*score))
                    }
                    MatchOutcome::NoMatch => {
                        events
                            .append(
                                conn,
                                &EventDraft::new(EventType::ProductNotFound, "lote", lote_id)
                                    .payload(json!({
                                        "product_raw": line.product_raw,
                                        "product_norm": product_norm,
                                    })),
                            )
                            .await?;
                        (FAMILY_OTHERS, None, None)
                    }
                };

                // The functional code is the family in this system.
                let functional_code = family;
                let operator = if matched.is_match() {
                    let assignment = despacho_assign::assign_operator(
                        conn,
                        shift.id,
                        &client.name,
                        functional_code,
                    )
                    .await?;
                    if assignment.operator.is_none() {
                        events
                            .append(
                                conn,
                                &EventDraft::new(EventType::EmptyOperatorPool, "lote", lote_id)
                                    .payload(json!({ "functional_code": functional_code })),
                            )
                            .await?;
                    }
                    assignment.operator
                } else {
                    None
                };

                orders::insert_line(
                    conn,
                    &orders::NewLine {
                        client_order_id: client_id,
                        seq_in_client: idx as i64 + 1,
                        quantity: line.quantity,
                        unit_raw: line.unit_raw.clone(),
                        product_raw: line.product_raw.clone(),
                        product_norm,
                        price: Some(line.price),
                        currency: LINE_CURRENCY.to_string(),
                        match_method,
                        match_score,
                        family,
                        functional_code,
                        operator_user: operator,
                        assigned_at: operator.map(|_| now),
                    },
                )
                .await?;
                line_count += 1;
            }
        }

        lotes::set_status(conn, lote_id, ParseStatus::Ok, None).await?;
        events
            .append(
                conn,
                &EventDraft::new(EventType::LoteProcessed, "lote", lote_id).payload(json!({
                    "route": route_norm,
                    "clients": parse.clients.len(),
                    "lines": line_count,
                })),
            )
            .await?;
        info!(lote_id, route = %route_norm, clients = parse.clients.len(), lines = line_count, "lote processed");
        Ok(Some(route_day.id))
    }
}
