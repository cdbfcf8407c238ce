// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! despacho-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The event catalog: types, records, and drafts.
pub mod event;

pub use event::{EventDraft, EventRecord, EventType};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a [`Shift`] row.
pub type ShiftId = i64;
/// Identifier of a [`Lote`] row.
pub type LoteId = i64;
/// Identifier of a [`RouteDay`] row.
pub type RouteDayId = i64;
/// Identifier of a [`ClientOrder`] row.
pub type ClientOrderId = i64;
/// Identifier of a [`Line`] row.
pub type LineId = i64;
/// Identifier of a [`PrintJob`] row.
pub type PrintJobId = i64;
/// Identifier of a warehouse user (operators, collectors, admins).
pub type UserId = i64;
/// Identifier of a persisted event.
pub type EventId = i64;
/// Version number of a products or routes catalog.
pub type CatalogVersion = i64;

/// The catch-all product family used when a line matches nothing.
pub const FAMILY_OTHERS: i64 = 6;

/// A value arrived that does not belong to the expected enumeration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct InvalidValue {
    /// What was being parsed (e.g. `"shift slot"`).
    pub what: &'static str,
    /// The offending input.
    pub value: String,
}

impl InvalidValue {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

macro_rules! stable_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal, { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant,)+
        }

        impl $name {
            /// Stable `&'static str` wire form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = InvalidValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(InvalidValue::new($what, other)),
                }
            }
        }
    };
}

stable_enum!(
    /// Time slot of a warehouse shift.
    Slot, "shift slot", {
        /// Morning slot.
        Morning => "MORNING",
        /// Afternoon slot.
        Afternoon => "AFTERNOON",
        /// Night slot.
        Night => "NIGHT",
    }
);

stable_enum!(
    /// Lifecycle state of a [`Shift`]. At most one shift is `ACTIVE`
    /// system-wide.
    ShiftState, "shift state", {
        /// Created but not yet opened.
        Created => "CREATED",
        /// The one currently running shift.
        Active => "ACTIVE",
        /// Closed manually or by the auto-closer.
        Closed => "CLOSED",
    }
);

stable_enum!(
    /// Parse outcome of a [`Lote`].
    ParseStatus, "parse status", {
        /// Ingested, not yet processed.
        Pending => "PENDING",
        /// Fully processed; clients and lines exist.
        Ok => "OK",
        /// The subject matched no route in the active catalog.
        ErrorRoute => "ERROR_ROUTE",
        /// The body (or the message itself) could not be processed.
        ErrorParse => "ERROR_PARSE",
    }
);

stable_enum!(
    /// Derived wall-display color of a route within a shift.
    VisualState, "visual state", {
        /// Pending work, nothing alarming.
        Blue => "BLUE",
        /// Everything printed.
        Green => "GREEN",
        /// New work landed after the route was complete or collected.
        Red => "RED",
    }
);

stable_enum!(
    /// Collector-driven logical state of a route within a shift.
    LogicalState, "logical state", {
        /// Being worked.
        Active => "ACTIVE",
        /// Physically collected by the route collector.
        Collected => "COLLECTED",
    }
);

stable_enum!(
    /// How a line's product was resolved against the catalog.
    MatchMethod, "match method", {
        /// Normalized names were identical.
        Exact => "EXACT",
        /// Best Levenshtein ratio met the threshold.
        Fuzzy => "FUZZY",
    }
);

stable_enum!(
    /// Why the assignment engine picked (or skipped) an operator.
    AssignmentReason, "assignment reason", {
        /// The per-shift client binding resolved.
        Affinity => "AFFINITY",
        /// The rotating cursor advanced to the next pool member.
        RoundRobin => "ROUND_ROBIN",
        /// No operator is qualified for the functional code.
        NoPool => "NO_POOL",
    }
);

stable_enum!(
    /// Kind of a [`PrintJob`].
    PrintJobKind, "print job kind", {
        /// Operator snapshot up to the cutoff lote.
        OperatorInitial => "OPERATOR_INITIAL",
        /// Operator lines strictly after the last printed lote.
        OperatorNew => "OPERATOR_NEW",
        /// Collector lines strictly after the last closed lote.
        CollectorNew => "COLLECTOR_NEW",
        /// Re-emission of an earlier job's item set; advances no cursor.
        Reprint => "REPRINT",
    }
);

stable_enum!(
    /// Status of a [`PrintJob`].
    PrintJobStatus, "print job status", {
        /// Row created, document not yet rendered.
        Created => "CREATED",
        /// Document rendered and stored.
        PdfReady => "PDF_READY",
        /// Handed to the physical printer.
        Sent => "SENT",
        /// Rendering failed; no line was stamped.
        Failed => "FAILED",
    }
);

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A warehouse operation time slot. Unique on `(date, slot)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    /// Row identifier.
    pub id: ShiftId,
    /// Operating date.
    pub date: NaiveDate,
    /// Slot within the date.
    pub slot: Slot,
    /// Lifecycle state.
    pub state: ShiftState,
    /// When the shift was opened.
    pub started_at: Option<DateTime<Utc>>,
    /// When the auto-closer will end it.
    pub scheduled_end_at: Option<DateTime<Utc>>,
    /// When it actually ended.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Per-slot operating schedule row; consumed by `open_shift`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Slot this schedule configures.
    pub slot: Slot,
    /// Whether the row is in force.
    pub active: bool,
    /// End-of-shift hour (0–23).
    pub end_hour: i64,
    /// End-of-shift minute (0–59).
    pub end_minute: i64,
}

/// One ingested email: a raw batch of orders for a single route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lote {
    /// Row identifier.
    pub id: LoteId,
    /// IMAP mailbox generation the message was fetched under. `None` for
    /// carried-over lotes.
    pub imap_uidvalidity: Option<i64>,
    /// IMAP UID within that generation. `None` for carried-over lotes.
    pub imap_uid: Option<i64>,
    /// When the message was ingested.
    pub received_at: DateTime<Utc>,
    /// Raw subject line.
    pub subject_raw: String,
    /// Raw body text.
    pub body_raw: String,
    /// Parse outcome.
    pub parse_status: ParseStatus,
    /// Error detail for `ERROR_ROUTE` / `ERROR_PARSE`.
    pub parse_error: Option<String>,
    /// Route materialization, set once the subject resolves.
    pub route_day_id: Option<RouteDayId>,
    /// Products catalog version bound at processing time.
    pub products_catalog_version: Option<CatalogVersion>,
    /// Routes catalog version bound at processing time.
    pub routes_catalog_version: Option<CatalogVersion>,
    /// Shift that owns this lote.
    pub shift_id: ShiftId,
    /// Whether this lote was duplicated from the previous shift.
    pub carried_over: bool,
    /// Row creation instant; first key of the lote ordering.
    pub created_at: DateTime<Utc>,
}

/// Per-shift materialization of a delivery route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDay {
    /// Row identifier.
    pub id: RouteDayId,
    /// Owning shift (cascade delete).
    pub shift_id: ShiftId,
    /// Normalized route name.
    pub route_norm: String,
    /// Derived wall-display color.
    pub visual_state: VisualState,
    /// Collector-driven state.
    pub logical_state: LogicalState,
    /// Times a collected route was promoted out of GREEN by new work.
    pub reactivations_count: i64,
    /// Last instant the route-state manager touched this row.
    pub last_event_at: Option<DateTime<Utc>>,
}

/// One client's sub-section inside a lote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOrder {
    /// Row identifier.
    pub id: ClientOrderId,
    /// Owning lote (cascade delete).
    pub lote_id: LoteId,
    /// Client name as written in the email.
    pub name_raw: String,
    /// Normalized client name; the affinity key.
    pub affinity_key: String,
    /// Free-text observations, if the email carried any.
    pub observations: Option<String>,
}

/// One product line in a client order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    /// Row identifier.
    pub id: LineId,
    /// Owning client order (cascade delete).
    pub client_order_id: ClientOrderId,
    /// Position within the client order.
    pub seq_in_client: i64,
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Unit as written (`"L"`, `"kg"`, ...).
    pub unit_raw: String,
    /// Product as written.
    pub product_raw: String,
    /// Normalized product name.
    pub product_norm: String,
    /// Unit price, if the email carried one.
    pub price: Option<Decimal>,
    /// Price currency.
    pub currency: String,
    /// How the product matched, if it did.
    pub match_method: Option<MatchMethod>,
    /// Match score in `[0, 1]`, if it matched.
    pub match_score: Option<f64>,
    /// Product family (1–6; 6 is the catch-all).
    pub family: i64,
    /// Functional code (equal to `family` in this system).
    pub functional_code: i64,
    /// Assigned operator, when the pool allowed one.
    pub operator_user: Option<UserId>,
    /// When the operator was assigned.
    pub assigned_at: Option<DateTime<Utc>>,
    /// First successful print commit; `None` iff never printed.
    pub printed_at: Option<DateTime<Utc>>,
    /// Number of print commits that included this line.
    pub print_count: i64,
}

/// A committed print emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    /// Row identifier.
    pub id: PrintJobId,
    /// Shift the job belongs to.
    pub shift_id: ShiftId,
    /// Normalized route name.
    pub route_norm: String,
    /// Acting user, when attributed.
    pub actor_user: Option<UserId>,
    /// Job kind.
    pub kind: PrintJobKind,
    /// Job status.
    pub status: PrintJobStatus,
    /// Reference to the stored document blob.
    pub pdf_ref: String,
    /// Snapshot boundary for OPERATOR_INITIAL jobs.
    pub cutoff_lote: Option<LoteId>,
    /// First lote covered, for incremental jobs.
    pub from_lote: Option<LoteId>,
    /// Last lote covered.
    pub to_lote: Option<LoteId>,
    /// Render failure detail for FAILED jobs.
    pub error_text: Option<String>,
    /// Row creation instant.
    pub created_at: DateTime<Utc>,
}

/// Per-(shift, operator, route) print bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorRouteProgress {
    /// Shift key.
    pub shift_id: ShiftId,
    /// Operator key.
    pub operator_user: UserId,
    /// Route key.
    pub route_norm: String,
    /// First-enter instant.
    pub entered_at: DateTime<Utc>,
    /// Snapshot boundary captured at first enter; never advances.
    pub cutoff_lote: Option<LoteId>,
    /// Monotone cursor of the newest printed lote.
    pub last_printed_lote: Option<LoteId>,
    /// When the cursor last advanced.
    pub last_printed_at: Option<DateTime<Utc>>,
}

/// Per-(shift, route) collector print bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorRouteProgress {
    /// Shift key.
    pub shift_id: ShiftId,
    /// Route key.
    pub route_norm: String,
    /// Monotone cursor of the newest collected lote.
    pub last_closed_lote: Option<LoteId>,
    /// When the cursor last advanced.
    pub last_closed_at: Option<DateTime<Utc>>,
}

/// Persisted IMAP poll cursor, one row per mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapCursor {
    /// Mailbox (folder) name.
    pub mailbox: String,
    /// Highest UID ingested under the current generation.
    pub last_uid: i64,
    /// Mailbox generation; `None` until the first successful poll or
    /// after a reset.
    pub uidvalidity: Option<i64>,
    /// Last completed poll cycle.
    pub last_poll_at: Option<DateTime<Utc>>,
}

/// One entry of a products catalog version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    /// Row identifier.
    pub id: i64,
    /// Normalized product name.
    pub norm_name: String,
    /// Product family (1–6).
    pub family: i64,
}

/// Aggregated per-route view served to the wall display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    /// RouteDay identifier.
    pub route_id: RouteDayId,
    /// Normalized route name.
    pub route_name: String,
    /// Wall color.
    pub visual_state: VisualState,
    /// Collector state.
    pub logical_state: LogicalState,
    /// Lines not yet printed.
    pub unprinted: i64,
    /// All lines in the route this shift.
    pub total_lines: i64,
    /// All client orders in the route this shift.
    pub total_clients: i64,
    /// Lotes materialized for the route this shift.
    pub lotes_count: i64,
}
