// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

/// Request/response types and the JSON handlers.
pub mod api;
/// The SSE stream endpoint.
pub mod sse;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use despacho_bus::EventBus;
use despacho_core::UserId;
use despacho_engine::{BatchProcessor, EngineError, PrintManager, ShiftManager};
use despacho_ingest::IngestHandle;
use despacho_store::Store;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Persistence.
    pub store: Store,
    /// Event bus for the SSE tail.
    pub bus: EventBus,
    /// Shift lifecycle.
    pub shifts: ShiftManager,
    /// Print engine.
    pub printer: PrintManager,
    /// Lote processor (manual re-triggering).
    pub processor: BatchProcessor,
    /// Ingest worker status + "poll now".
    pub ingest: IngestHandle,
}

/// JSON error envelope: `{code, message}` with a mapped HTTP status.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Build an error with an explicit status.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// 400 with `VALIDATION_BLOCKED`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_BLOCKED", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::RouteNotFound { .. }
            | EngineError::ScheduleNotFound { .. }
            | EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Forbidden => StatusCode::FORBIDDEN,
            EngineError::AuthRequired => StatusCode::UNAUTHORIZED,
            EngineError::NoActiveShift
            | EngineError::ShiftAlreadyActive
            | EngineError::DuplicateShift { .. }
            | EngineError::NoActiveCatalog { .. }
            | EngineError::NothingToPrint
            | EngineError::NoEnter
            | EngineError::NoInitial
            | EngineError::ValidationBlocked { .. } => StatusCode::CONFLICT,
            EngineError::Render(_) | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<despacho_store::StoreError> for ApiError {
    fn from(err: despacho_store::StoreError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE", err.to_string())
    }
}

/// Optional actor attribution from the `X-Actor-Id` header. Login and
/// session machinery live outside the core.
pub fn actor_from(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// The actor, or `AUTH_REQUIRED` for endpoints that need one.
pub fn require_actor(headers: &HeaderMap) -> Result<UserId, ApiError> {
    actor_from(headers).ok_or_else(|| ApiError::from(EngineError::AuthRequired))
}

/// Build the Axum router with all control-plane routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/shifts/open", post(api::open_shift))
        .route("/api/shifts/{id}/close", post(api::close_shift))
        .route("/api/shifts/active", get(api::active_shift))
        .route("/api/routes", get(api::route_summaries))
        .route("/api/routes/{route_id}/mark-collected", post(api::mark_collected))
        .route("/api/routes/{route_id}/reactivate", post(api::reactivate))
        .route("/api/print/routes/{route}/operator/enter", post(api::operator_enter))
        .route(
            "/api/print/routes/{route}/operator/print-initial",
            post(api::operator_print_initial),
        )
        .route(
            "/api/print/routes/{route}/operator/print-new",
            post(api::operator_print_new),
        )
        .route(
            "/api/print/routes/{route}/collector/print-new",
            post(api::collector_print_new),
        )
        .route("/api/print/jobs/{id}/reprint", post(api::reprint_job))
        .route("/api/print/jobs/{id}/pdf", get(api::job_pdf))
        .route("/api/events", get(api::events_page))
        .route("/api/events/stream", get(sse::stream))
        .route("/api/imap/status", get(api::imap_status))
        .route("/api/imap/force-poll", post(api::force_poll))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
