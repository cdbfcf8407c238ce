// SPDX-License-Identifier: MIT OR Apache-2.0
//! The print-job engine: operator enter/initial/new, collector sheets,
//! reprints, and the renderer seam.
//!
//! Document rendering happens outside the commit transaction; the commit
//! stamps lines, links job items, advances exactly one cursor, and
//! publishes `PRINT_EMITTED`. A render failure records a FAILED job and
//! touches nothing else.

use crate::{EngineError, route_state};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use despacho_bus::{EventBus, TxnEvents};
use despacho_core::{
    EventDraft, EventType, LogicalState, LoteId, PrintJobId, PrintJobKind, PrintJobStatus,
    RouteDayId, ShiftId, UserId,
};
use despacho_store::orders::SelectedLine;
use despacho_store::{Store, lotes, orders, print as jobs, progress, routes, shifts};
use rust_decimal::Decimal;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Documents and the renderer seam
// ---------------------------------------------------------------------------

/// One printable line item.
#[derive(Debug, Clone)]
pub struct ComandaItem {
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Unit as written.
    pub unit: String,
    /// Product as written.
    pub product: String,
    /// Unit price, when present.
    pub price: Option<Decimal>,
    /// Price currency.
    pub currency: String,
    /// Assigned operator (shown on collection sheets).
    pub operator: Option<UserId>,
}

/// One client block on a comanda.
#[derive(Debug, Clone)]
pub struct ClientSection {
    /// Client name as written in the email.
    pub client_name: String,
    /// Observations under the client header.
    pub observations: Option<String>,
    /// Items in selector order.
    pub items: Vec<ComandaItem>,
}

/// A complete document handed to the renderer.
#[derive(Debug, Clone)]
pub struct PrintDocument {
    /// Job kind (thermal slip vs A4 sheet vs reprint).
    pub kind: PrintJobKind,
    /// Normalized route name.
    pub route: String,
    /// Operator, for per-operator slips.
    pub operator: Option<UserId>,
    /// Generation instant.
    pub generated_at: DateTime<Utc>,
    /// Client blocks.
    pub sections: Vec<ClientSection>,
}

impl PrintDocument {
    /// Total item count across sections.
    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }
}

/// Rendering failed; the print engine records a FAILED job.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RenderError(pub String);

/// Turns a [`PrintDocument`] into stored bytes. The production deployment
/// plugs a PDF library in here; the in-tree renderer emits plain text.
#[async_trait]
pub trait ComandaRenderer: Send + Sync {
    /// Render the document.
    async fn render(&self, document: &PrintDocument) -> Result<Vec<u8>, RenderError>;
}

/// Deterministic UTF-8 rendering, good enough for thermal printers and
/// tests alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRenderer;

#[async_trait]
impl ComandaRenderer for TextRenderer {
    async fn render(&self, document: &PrintDocument) -> Result<Vec<u8>, RenderError> {
        let mut out = String::new();
        out.push_str(&format!("== {} / {} ==\n", document.kind, document.route));
        if let Some(op) = document.operator {
            out.push_str(&format!("operador: {op}\n"));
        }
        out.push_str(&format!("generado: {}\n", document.generated_at.to_rfc3339()));
        for section in &document.sections {
            out.push_str(&format!("\nCliente: {}\n", section.client_name));
            if let Some(obs) = &section.observations {
                out.push_str(&format!("Observaciones: {obs}\n"));
            }
            for item in &section.items {
                out.push_str(&format!("  {} {} - {}", item.quantity, item.unit, item.product));
                if let Some(price) = item.price {
                    out.push_str(&format!(" - {} {}", price, item.currency));
                }
                if let Some(op) = item.operator {
                    out.push_str(&format!("  [op {op}]"));
                }
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }
}

/// Group selected lines into client sections, preserving selector order.
pub fn build_document(
    kind: PrintJobKind,
    route: &str,
    operator: Option<UserId>,
    selected: &[SelectedLine],
) -> PrintDocument {
    let mut sections: Vec<ClientSection> = Vec::new();
    let mut current_client: Option<i64> = None;
    for sel in selected {
        let item = ComandaItem {
            quantity: sel.line.quantity,
            unit: sel.line.unit_raw.clone(),
            product: sel.line.product_raw.clone(),
            price: sel.line.price,
            currency: sel.line.currency.clone(),
            operator: sel.line.operator_user,
        };
        if current_client == Some(sel.line.client_order_id) {
            if let Some(section) = sections.last_mut() {
                section.items.push(item);
                continue;
            }
        }
        // A new client block opens with its first item already in place.
        current_client = Some(sel.line.client_order_id);
        sections.push(ClientSection {
            client_name: sel.client_name.clone(),
            observations: sel.client_observations.clone(),
            items: vec![item],
        });
    }
    PrintDocument {
        kind,
        route: route.to_string(),
        operator,
        generated_at: Utc::now(),
        sections,
    }
}

// ---------------------------------------------------------------------------
// PrintManager
// ---------------------------------------------------------------------------

/// Outcome of an operator "enter route" call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterOutcome {
    /// The snapshot boundary (existing one on re-enter).
    pub cutoff_lote: Option<LoteId>,
    /// Whether this call created the progress row.
    pub entered: bool,
}

/// Outcome of a committed print.
#[derive(Debug, Clone)]
pub struct PrintReceipt {
    /// The job row.
    pub job_id: PrintJobId,
    /// Lines included.
    pub lines_count: usize,
    /// Stored document reference.
    pub pdf_ref: String,
}

#[derive(Clone, Copy)]
enum CursorAdvance {
    Operator(UserId),
    Collector,
    Keep,
}

/// Transactional print-job creation with cutoff/cursor semantics.
#[derive(Clone)]
pub struct PrintManager {
    store: Store,
    bus: EventBus,
    renderer: Arc<dyn ComandaRenderer>,
    pdf_dir: PathBuf,
}

impl std::fmt::Debug for PrintManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintManager")
            .field("pdf_dir", &self.pdf_dir)
            .finish_non_exhaustive()
    }
}

impl PrintManager {
    /// Build a manager writing documents under `pdf_dir`.
    pub fn new(
        store: Store,
        bus: EventBus,
        renderer: Arc<dyn ComandaRenderer>,
        pdf_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bus,
            renderer,
            pdf_dir: pdf_dir.into(),
        }
    }

    /// Operator "enter route": captures the cutoff snapshot on first
    /// enter; re-entering changes nothing. Entering a COLLECTED route
    /// flips it back to ACTIVE.
    pub async fn enter_route(
        &self,
        operator: UserId,
        route_norm: &str,
    ) -> Result<EnterOutcome, EngineError> {
        let mut tx = self.store.begin().await.map_err(EngineError::Store)?;
        let shift = shifts::find_active(&mut tx)
            .await?
            .ok_or(EngineError::NoActiveShift)?;
        let rd = routes::find(&mut tx, shift.id, route_norm)
            .await?
            .ok_or_else(|| EngineError::RouteNotFound {
                route: route_norm.to_string(),
            })?;

        let now = Utc::now();
        let latest = lotes::latest_ok(&mut tx, rd.id).await?;
        let entered = progress::enter_operator(&mut tx, shift.id, operator, route_norm, latest, now)
            .await?;

        let mut events = TxnEvents::new();
        if entered {
            events
                .append(
                    &mut tx,
                    &EventDraft::new(EventType::OperatorEnteredRoute, "route", rd.id)
                        .actor(operator)
                        .payload(json!({
                            "route": route_norm,
                            "operator": operator,
                            "cutoff_lote": latest,
                        })),
                )
                .await?;
        }

        let was_collected = rd.logical_state == LogicalState::Collected;
        if was_collected {
            routes::set_logical(&mut tx, rd.id, LogicalState::Active, now).await?;
        }

        let current = progress::operator_progress(&mut tx, shift.id, operator, route_norm)
            .await?
            .ok_or(EngineError::NoEnter)?;

        tx.commit().await.map_err(despacho_store::StoreError::from)?;
        events.flush(&self.bus);
        if was_collected {
            route_state::sync_route_state(&self.store, &self.bus, rd.id).await?;
        }

        Ok(EnterOutcome {
            cutoff_lote: current.cutoff_lote,
            entered,
        })
    }

    /// Operator initial print: the snapshot up to the cutoff.
    pub async fn print_operator_initial(
        &self,
        operator: UserId,
        route_norm: &str,
    ) -> Result<PrintReceipt, EngineError> {
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        let shift = shifts::find_active(&mut conn)
            .await?
            .ok_or(EngineError::NoActiveShift)?;
        let rd = routes::find(&mut conn, shift.id, route_norm)
            .await?
            .ok_or_else(|| EngineError::RouteNotFound {
                route: route_norm.to_string(),
            })?;
        let prog = progress::operator_progress(&mut conn, shift.id, operator, route_norm)
            .await?
            .ok_or(EngineError::NoEnter)?;
        let cutoff = prog.cutoff_lote.ok_or(EngineError::NothingToPrint)?;
        let selected = orders::select_operator_initial(&mut conn, rd.id, operator, cutoff).await?;
        drop(conn);
        if selected.is_empty() {
            return Err(EngineError::NothingToPrint);
        }

        self.commit_job(
            shift.id,
            rd.id,
            route_norm,
            Some(operator),
            PrintJobKind::OperatorInitial,
            Some(cutoff),
            selected,
            CursorAdvance::Operator(operator),
        )
        .await
    }

    /// Operator incremental print: lines strictly after the last printed
    /// lote. Refused before the initial print when a cutoff exists.
    pub async fn print_operator_new(
        &self,
        operator: UserId,
        route_norm: &str,
    ) -> Result<PrintReceipt, EngineError> {
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        let shift = shifts::find_active(&mut conn)
            .await?
            .ok_or(EngineError::NoActiveShift)?;
        let rd = routes::find(&mut conn, shift.id, route_norm)
            .await?
            .ok_or_else(|| EngineError::RouteNotFound {
                route: route_norm.to_string(),
            })?;
        let prog = progress::operator_progress(&mut conn, shift.id, operator, route_norm)
            .await?
            .ok_or(EngineError::NoEnter)?;
        if prog.cutoff_lote.is_some() && prog.last_printed_at.is_none() {
            return Err(EngineError::NoInitial);
        }
        let selected =
            orders::select_operator_new(&mut conn, rd.id, operator, prog.last_printed_lote).await?;
        drop(conn);
        if selected.is_empty() {
            return Err(EngineError::NothingToPrint);
        }

        self.commit_job(
            shift.id,
            rd.id,
            route_norm,
            Some(operator),
            PrintJobKind::OperatorNew,
            None,
            selected,
            CursorAdvance::Operator(operator),
        )
        .await
    }

    /// Collector incremental print: every line strictly after the colecta
    /// cursor, regardless of operator.
    pub async fn print_collector_new(
        &self,
        actor: Option<UserId>,
        route_norm: &str,
    ) -> Result<PrintReceipt, EngineError> {
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        let shift = shifts::find_active(&mut conn)
            .await?
            .ok_or(EngineError::NoActiveShift)?;
        let rd = routes::find(&mut conn, shift.id, route_norm)
            .await?
            .ok_or_else(|| EngineError::RouteNotFound {
                route: route_norm.to_string(),
            })?;
        if let Some(collector) = routes::collector_for(&mut conn, shift.id, route_norm).await? {
            if actor != Some(collector) {
                return Err(EngineError::Forbidden);
            }
        }
        let after = progress::collector_progress(&mut conn, shift.id, route_norm)
            .await?
            .and_then(|p| p.last_closed_lote);
        let selected = orders::select_collector_new(&mut conn, rd.id, after).await?;
        drop(conn);
        if selected.is_empty() {
            return Err(EngineError::NothingToPrint);
        }

        self.commit_job(
            shift.id,
            rd.id,
            route_norm,
            actor,
            PrintJobKind::CollectorNew,
            None,
            selected,
            CursorAdvance::Collector,
        )
        .await
    }

    /// Re-emit the item set of an earlier job: increments `print_count`,
    /// advances no cursor.
    pub async fn reprint(
        &self,
        job_id: PrintJobId,
        actor: Option<UserId>,
    ) -> Result<PrintReceipt, EngineError> {
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        let job = jobs::get_job(&mut conn, job_id)
            .await?
            .ok_or(EngineError::NotFound {
                what: "print job",
                id: job_id,
            })?;
        if job.status == PrintJobStatus::Failed {
            return Err(EngineError::ValidationBlocked {
                reason: "cannot reprint a failed job".into(),
            });
        }
        let selected = jobs::job_lines(&mut conn, job_id).await?;
        let route_day = routes::find(&mut conn, job.shift_id, &job.route_norm).await?;
        drop(conn);
        if selected.is_empty() {
            return Err(EngineError::NothingToPrint);
        }
        let Some(rd) = route_day else {
            return Err(EngineError::RouteNotFound {
                route: job.route_norm.clone(),
            });
        };

        self.commit_job(
            job.shift_id,
            rd.id,
            &job.route_norm,
            actor.or(job.actor_user),
            PrintJobKind::Reprint,
            job.cutoff_lote,
            selected,
            CursorAdvance::Keep,
        )
        .await
    }

    /// Render, store the document, then commit the job row, item links,
    /// line stamps, cursor advance, and the `PRINT_EMITTED` event.
    #[allow(clippy::too_many_arguments)]
    async fn commit_job(
        &self,
        shift_id: ShiftId,
        route_day_id: RouteDayId,
        route_norm: &str,
        actor: Option<UserId>,
        kind: PrintJobKind,
        cutoff: Option<LoteId>,
        selected: Vec<SelectedLine>,
        advance: CursorAdvance,
    ) -> Result<PrintReceipt, EngineError> {
        let operator = match advance {
            CursorAdvance::Operator(op) => Some(op),
            _ => None,
        };
        let document = build_document(kind, route_norm, operator, &selected);
        let pdf_ref = format!(
            "{}-{}.pdf",
            kind.as_str().to_ascii_lowercase().replace('_', "-"),
            Uuid::new_v4()
        );

        let rendered = self.renderer.render(&document).await;
        let bytes = match rendered {
            Ok(bytes) => bytes,
            Err(err) => {
                self.record_failed_job(shift_id, route_norm, actor, kind, cutoff, &err.0)
                    .await?;
                return Err(EngineError::Render(err.0));
            }
        };
        if let Err(err) = self.write_blob(&pdf_ref, &bytes).await {
            self.record_failed_job(shift_id, route_norm, actor, kind, cutoff, &err)
                .await?;
            return Err(EngineError::Render(err));
        }

        let from_lote = selected.first().map(|s| s.lote_id);
        let to_lote = selected.last().map(|s| s.lote_id);
        let line_ids: Vec<_> = selected.iter().map(|s| s.line.id).collect();
        let now = Utc::now();

        let mut tx = self.store.begin().await.map_err(EngineError::Store)?;
        let job_id = jobs::insert_job(
            &mut tx,
            &jobs::NewPrintJob {
                shift_id,
                route_norm: route_norm.to_string(),
                actor_user: actor,
                kind,
                status: PrintJobStatus::PdfReady,
                pdf_ref: pdf_ref.clone(),
                cutoff_lote: cutoff,
                from_lote,
                to_lote,
                error_text: None,
            },
            now,
        )
        .await?;
        jobs::insert_items(&mut tx, job_id, &line_ids).await?;
        orders::stamp_printed(&mut tx, &line_ids, now).await?;

        match advance {
            CursorAdvance::Operator(op) => {
                if let Some(to) = to_lote {
                    progress::advance_operator_printed(&mut tx, shift_id, op, route_norm, to, now)
                        .await?;
                }
            }
            CursorAdvance::Collector => {
                if let Some(to) = to_lote {
                    progress::advance_collector_closed(&mut tx, shift_id, route_norm, to, now)
                        .await?;
                }
            }
            CursorAdvance::Keep => {}
        }

        let mut events = TxnEvents::new();
        let mut draft = EventDraft::new(EventType::PrintEmitted, "print_job", job_id).payload(
            json!({
                "kind": kind,
                "route": route_norm,
                "lines": line_ids.len(),
                "pdf_ref": pdf_ref,
            }),
        );
        if let Some(actor) = actor {
            draft = draft.actor(actor);
        }
        events.append(&mut tx, &draft).await?;
        tx.commit().await.map_err(despacho_store::StoreError::from)?;
        events.flush(&self.bus);
        info!(job_id, kind = %kind, route = %route_norm, lines = line_ids.len(), "print emitted");

        route_state::sync_route_state(&self.store, &self.bus, route_day_id).await?;

        Ok(PrintReceipt {
            job_id,
            lines_count: line_ids.len(),
            pdf_ref,
        })
    }

    /// Record a FAILED job: no items, no stamps, no cursor movement.
    async fn record_failed_job(
        &self,
        shift_id: ShiftId,
        route_norm: &str,
        actor: Option<UserId>,
        kind: PrintJobKind,
        cutoff: Option<LoteId>,
        error: &str,
    ) -> Result<(), EngineError> {
        warn!(route = %route_norm, kind = %kind, error, "document render failed");
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        jobs::insert_job(
            &mut conn,
            &jobs::NewPrintJob {
                shift_id,
                route_norm: route_norm.to_string(),
                actor_user: actor,
                kind,
                status: PrintJobStatus::Failed,
                pdf_ref: String::new(),
                cutoff_lote: cutoff,
                from_lote: None,
                to_lote: None,
                error_text: Some(error.to_string()),
            },
            Utc::now(),
        )
        .await?;
        Ok(())
    }

    async fn write_blob(&self, pdf_ref: &str, bytes: &[u8]) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.pdf_dir)
            .await
            .map_err(|e| format!("create pdf dir: {e}"))?;
        tokio::fs::write(self.pdf_dir.join(pdf_ref), bytes)
            .await
            .map_err(|e| format!("write document: {e}"))
    }

    /// Read a stored document back (for the blob-serving endpoint).
    pub async fn read_blob(&self, pdf_ref: &str) -> Result<Vec<u8>, EngineError> {
        tokio::fs::read(self.pdf_dir.join(pdf_ref))
            .await
            .map_err(|e| EngineError::Render(format!("read document: {e}")))
    }
}
