// SPDX-License-Identifier: MIT OR Apache-2.0
//! The event catalog: everything the system publishes to the log and to
//! live subscribers.
//!
//! The set of event types is open at the storage layer (`EventRecord`
//! carries a plain string); [`EventType`] enumerates the types this
//! version of the system emits and recognizes.

use crate::{EventId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Recognized event types, by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // -- Shift lifecycle --
    /// A shift was opened.
    ShiftStarted,
    /// A shift was closed manually.
    ShiftClosed,
    /// A shift was closed by the auto-closer past its scheduled end.
    ShiftClosedAuto,

    // -- Ingest --
    /// A new message was materialized as a lote.
    NewEmail,
    /// A message could not be extracted; an error lote was recorded.
    EmailReadError,
    /// A message with an already-ingested `(uidvalidity, uid)` was skipped.
    DuplicateIgnored,

    // -- Parse / match --
    /// The subject matched no route in the active catalog.
    RouteParseError,
    /// The body yielded no clients.
    BodyParseError,
    /// A line's product matched nothing; the catch-all family was used.
    ProductNotFound,
    /// A line's product matched via the fuzzy phase.
    ProductFuzzyMatch,
    /// No operator is qualified for the line's functional code.
    EmptyOperatorPool,

    // -- Orchestration --
    /// A lote was fully processed.
    LoteProcessed,
    /// Processing a lote failed; the transaction rolled back.
    LoteProcessError,
    /// Unprinted work was copied into a newly opened shift.
    LoteCarriedOver,

    // -- Route state --
    /// A route transitioned into RED.
    RouteAlertRed,
    /// A route transitioned into GREEN.
    RouteCompleteGreen,
    /// A collector marked a route as collected.
    RouteCollected,

    // -- Print --
    /// An operator entered a route for the first time this shift.
    OperatorEnteredRoute,
    /// A print job was committed.
    PrintEmitted,

    // -- Catalog --
    /// A products catalog version was activated.
    ProductsActivated,
    /// A routes catalog version was activated.
    RoutesActivated,
}

impl EventType {
    /// Stable `&'static str` wire form (e.g. `"LOTE_PROCESSED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShiftStarted => "SHIFT_STARTED",
            Self::ShiftClosed => "SHIFT_CLOSED",
            Self::ShiftClosedAuto => "SHIFT_CLOSED_AUTO",
            Self::NewEmail => "NEW_EMAIL",
            Self::EmailReadError => "EMAIL_READ_ERROR",
            Self::DuplicateIgnored => "DUPLICATE_IGNORED",
            Self::RouteParseError => "ROUTE_PARSE_ERROR",
            Self::BodyParseError => "BODY_PARSE_ERROR",
            Self::ProductNotFound => "PRODUCT_NOT_FOUND",
            Self::ProductFuzzyMatch => "PRODUCT_FUZZY_MATCH",
            Self::EmptyOperatorPool => "EMPTY_OPERATOR_POOL",
            Self::LoteProcessed => "LOTE_PROCESSED",
            Self::LoteProcessError => "LOTE_PROCESS_ERROR",
            Self::LoteCarriedOver => "LOTE_CARRIED_OVER",
            Self::RouteAlertRed => "ROUTE_ALERT_RED",
            Self::RouteCompleteGreen => "ROUTE_COMPLETE_GREEN",
            Self::RouteCollected => "ROUTE_COLLECTED",
            Self::OperatorEnteredRoute => "OPERATOR_ENTERED_ROUTE",
            Self::PrintEmitted => "PRINT_EMITTED",
            Self::ProductsActivated => "PRODUCTS_ACTIVATED",
            Self::RoutesActivated => "ROUTES_ACTIVATED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventRecord / EventDraft
// ---------------------------------------------------------------------------

/// One persisted event. Append-only; never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Log position; assigned at append.
    pub id: EventId,
    /// Append instant; assigned at append.
    pub ts: DateTime<Utc>,
    /// Acting user, when attributed.
    pub actor: Option<UserId>,
    /// Event type (open set; see [`EventType`] for the recognized ones).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Kind of entity the event is about (`"shift"`, `"lote"`, ...).
    pub entity_type: String,
    /// Identifier of that entity, stringified.
    pub entity_id: String,
    /// Opaque payload map.
    pub payload: serde_json::Value,
}

/// An event that has not been appended yet.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Acting user, when attributed.
    pub actor: Option<UserId>,
    /// Event type.
    pub event_type: EventType,
    /// Kind of entity the event is about.
    pub entity_type: &'static str,
    /// Identifier of that entity, stringified.
    pub entity_id: String,
    /// Opaque payload map.
    pub payload: serde_json::Value,
}

impl EventDraft {
    /// Start a draft with an empty payload and no actor.
    pub fn new(
        event_type: EventType,
        entity_type: &'static str,
        entity_id: impl ToString,
    ) -> Self {
        Self {
            actor: None,
            event_type,
            entity_type,
            entity_id: entity_id.to_string(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Attach a payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attribute the event to a user.
    pub fn actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }
}
