// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON handlers for the control-plane endpoints.

use crate::{ApiError, AppState, actor_from, require_actor};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{NaiveDate, Utc};
use despacho_core::{EventRecord, PrintJobId, RouteDayId, ShiftId, Slot};
use despacho_engine::{EngineError, PrintReceipt, route_state};
use despacho_store::{assignment, events, print as jobs, routes, shifts};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health`.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Shifts
// ---------------------------------------------------------------------------

/// Body of `POST /api/shifts/open`.
#[derive(Debug, Deserialize)]
pub struct OpenShiftRequest {
    /// Slot to open.
    pub slot: Slot,
    /// Operating date (`YYYY-MM-DD`).
    pub date: NaiveDate,
}

/// `POST /api/shifts/open`.
pub async fn open_shift(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OpenShiftRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let shift = state
        .shifts
        .open_shift(req.slot, req.date, actor_from(&headers))
        .await?;
    Ok(Json(json!({
        "id": shift.id,
        "state": shift.state,
        "started_at": shift.started_at,
        "scheduled_end_at": shift.scheduled_end_at,
    })))
}

/// `POST /api/shifts/{id}/close`.
pub async fn close_shift(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ShiftId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    {
        let mut conn = state.store.pool().acquire().await.map_err(|e| {
            ApiError::from(despacho_store::StoreError::from(e))
        })?;
        let active = shifts::find_active(&mut conn)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::from(EngineError::NoActiveShift))?;
        if active.id != id {
            return Err(ApiError::from(EngineError::ValidationBlocked {
                reason: format!("shift {id} is not the active shift"),
            }));
        }
    }
    let shift = state.shifts.close_shift(actor_from(&headers)).await?;
    Ok(Json(json!({
        "id": shift.id,
        "state": shift.state,
        "ended_at": shift.ended_at,
    })))
}

/// `GET /api/shifts/active`: the active shift with its configuration.
pub async fn active_shift(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state
        .store
        .pool()
        .acquire()
        .await
        .map_err(despacho_store::StoreError::from)?;
    let shift = shifts::find_active(&mut conn)
        .await?
        .ok_or_else(|| ApiError::from(EngineError::NoActiveShift))?;
    let qualifications = assignment::list_qualifications(&mut conn, shift.id).await?;
    Ok(Json(json!({
        "shift": shift,
        "qualifications": qualifications
            .iter()
            .map(|q| json!({
                "user_id": q.user_id,
                "functional_code": q.functional_code,
                "enabled": q.enabled,
            }))
            .collect::<Vec<_>>(),
    })))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Query of `GET /api/routes`.
#[derive(Debug, Deserialize)]
pub struct RoutesQuery {
    /// Shift to summarize; defaults to the active one.
    pub shift_id: Option<ShiftId>,
}

/// `GET /api/routes?shift_id=`.
pub async fn route_summaries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoutesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state
        .store
        .pool()
        .acquire()
        .await
        .map_err(despacho_store::StoreError::from)?;
    let shift_id = match query.shift_id {
        Some(id) => id,
        None => {
            shifts::find_active(&mut conn)
                .await?
                .ok_or_else(|| ApiError::from(EngineError::NoActiveShift))?
                .id
        }
    };
    let summaries = routes::summaries(&mut conn, shift_id).await?;
    Ok(Json(summaries))
}

/// `POST /api/routes/{route_id}/mark-collected`.
pub async fn mark_collected(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<RouteDayId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    route_state::mark_collected(&state.store, &state.bus, route_id, actor_from(&headers)).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /api/routes/{route_id}/reactivate`.
pub async fn reactivate(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<RouteDayId>,
) -> Result<impl IntoResponse, ApiError> {
    route_state::reactivate(&state.store, &state.bus, route_id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Print
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PrintResponse {
    job_id: PrintJobId,
    lines_count: usize,
    pdf_url: String,
}

impl From<PrintReceipt> for PrintResponse {
    fn from(receipt: PrintReceipt) -> Self {
        Self {
            job_id: receipt.job_id,
            lines_count: receipt.lines_count,
            pdf_url: format!("/api/print/jobs/{}/pdf", receipt.job_id),
        }
    }
}

/// `POST /api/print/routes/{route}/operator/enter`.
pub async fn operator_enter(
    State(state): State<Arc<AppState>>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let operator = require_actor(&headers)?;
    let outcome = state.printer.enter_route(operator, &route).await?;
    Ok(Json(json!({
        "cutoff_lote": outcome.cutoff_lote,
        "entered": outcome.entered,
    })))
}

/// `POST /api/print/routes/{route}/operator/print-initial`.
pub async fn operator_print_initial(
    State(state): State<Arc<AppState>>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let operator = require_actor(&headers)?;
    let receipt = state.printer.print_operator_initial(operator, &route).await?;
    Ok(Json(PrintResponse::from(receipt)))
}

/// `POST /api/print/routes/{route}/operator/print-new`.
pub async fn operator_print_new(
    State(state): State<Arc<AppState>>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let operator = require_actor(&headers)?;
    let receipt = state.printer.print_operator_new(operator, &route).await?;
    Ok(Json(PrintResponse::from(receipt)))
}

/// `POST /api/print/routes/{route}/collector/print-new`.
pub async fn collector_print_new(
    State(state): State<Arc<AppState>>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .printer
        .print_collector_new(actor_from(&headers), &route)
        .await?;
    Ok(Json(PrintResponse::from(receipt)))
}

/// `POST /api/print/jobs/{id}/reprint`.
pub async fn reprint_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PrintJobId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.printer.reprint(id, actor_from(&headers)).await?;
    Ok(Json(PrintResponse::from(receipt)))
}

/// `GET /api/print/jobs/{id}/pdf`: serve the stored document blob.
pub async fn job_pdf(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PrintJobId>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state
        .store
        .pool()
        .acquire()
        .await
        .map_err(despacho_store::StoreError::from)?;
    let job = jobs::get_job(&mut conn, id)
        .await?
        .ok_or_else(|| ApiError::from(EngineError::NotFound { what: "print job", id }))?;
    drop(conn);
    if job.pdf_ref.is_empty() {
        return Err(ApiError::from(EngineError::NotFound { what: "document", id }));
    }
    let bytes = state.printer.read_blob(&job.pdf_ref).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf")],
        bytes,
    ))
}

// ---------------------------------------------------------------------------
// Events (paged history)
// ---------------------------------------------------------------------------

/// Query of `GET /api/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Restrict to one event type.
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    /// Restrict to one entity kind.
    pub entity_type: Option<String>,
    /// Restrict to one entity id.
    pub entity_id: Option<String>,
    /// Exclusive upper bound for descending pagination.
    pub before_id: Option<i64>,
    /// Page size (1–200, default 50).
    pub limit: Option<i64>,
}

/// `GET /api/events`: newest first, with a continuation cursor.
pub async fn events_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state
        .store
        .pool()
        .acquire()
        .await
        .map_err(despacho_store::StoreError::from)?;
    let filter = events::EventFilter {
        event_type: query.event_type,
        entity_type: query.entity_type,
        entity_id: query.entity_id,
        before_id: query.before_id,
        limit: query.limit.unwrap_or(50),
    };
    let page: Vec<EventRecord> = events::page(&mut conn, &filter).await?;
    let count = page.len();
    let next_before_id = page.last().map(|e| e.id);
    Ok(Json(json!({
        "events": page,
        "pagination": {
            "count": count,
            "next_before_id": next_before_id,
        },
    })))
}

// ---------------------------------------------------------------------------
// IMAP
// ---------------------------------------------------------------------------

/// `GET /api/imap/status`.
pub async fn imap_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.ingest.status().await;
    Json(json!({
        "running": status.running,
        "connected": status.connected,
        "last_error": status.last_error,
        "last_poll_at": status.last_poll_at,
        "cursor": {
            "last_uid": status.last_uid,
            "uidvalidity": status.uidvalidity,
        },
    }))
}

/// `POST /api/imap/force-poll`.
pub async fn force_poll(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ok = state.ingest.nudge();
    Json(json!({ "ok": ok }))
}
