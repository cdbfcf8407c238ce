// SPDX-License-Identifier: MIT OR Apache-2.0
//! The engine error taxonomy. Every refusal carries a stable
//! `SCREAMING_SNAKE_CASE` code that the HTTP layer maps onto a status and
//! a JSON envelope.

use chrono::NaiveDate;
use despacho_core::Slot;
use despacho_store::StoreError;

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No shift is in ACTIVE state.
    #[error("no shift is currently active")]
    NoActiveShift,

    /// A shift is already ACTIVE; open refused.
    #[error("a shift is already active")]
    ShiftAlreadyActive,

    /// A `(date, slot)` shift row already exists.
    #[error("shift already exists for {date} {slot}")]
    DuplicateShift {
        /// Requested date.
        date: NaiveDate,
        /// Requested slot.
        slot: Slot,
    },

    /// No active schedule row configures the slot.
    #[error("no active schedule for slot {slot}")]
    ScheduleNotFound {
        /// Requested slot.
        slot: Slot,
    },

    /// The route is not materialized in the shift.
    #[error("route not found: {route}")]
    RouteNotFound {
        /// Normalized route name or route-day id.
        route: String,
    },

    /// The selection produced no lines.
    #[error("nothing to print")]
    NothingToPrint,

    /// The operator has not entered the route this shift.
    #[error("operator has not entered this route")]
    NoEnter,

    /// The initial print has not been emitted yet.
    #[error("initial print has not been emitted")]
    NoInitial,

    /// No catalog version is active.
    #[error("no active {which} catalog")]
    NoActiveCatalog {
        /// `"products"` or `"routes"`.
        which: &'static str,
    },

    /// The operation is blocked by current state.
    #[error("blocked: {reason}")]
    ValidationBlocked {
        /// What blocked it.
        reason: String,
    },

    /// The actor is not allowed to act on this resource.
    #[error("forbidden")]
    Forbidden,

    /// The operation needs an attributed actor.
    #[error("authentication required")]
    AuthRequired,

    /// A referenced entity does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// Entity kind.
        what: &'static str,
        /// Identifier.
        id: i64,
    },

    /// Document rendering failed; the job was recorded as FAILED.
    #[error("render failed: {0}")]
    Render(String),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoActiveShift => "NO_ACTIVE_SHIFT",
            Self::ShiftAlreadyActive => "SHIFT_ALREADY_ACTIVE",
            Self::DuplicateShift { .. } => "DUPLICATE_SHIFT",
            Self::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::NothingToPrint => "NOTHING_TO_PRINT",
            Self::NoEnter => "NO_ENTER",
            Self::NoInitial => "NO_INITIAL",
            Self::NoActiveCatalog { .. } => "NO_ACTIVE_CATALOG",
            Self::ValidationBlocked { .. } => "VALIDATION_BLOCKED",
            Self::Forbidden => "FORBIDDEN",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Render(_) => "RENDER_FAILED",
            Self::Store(_) => "STORAGE",
        }
    }
}
