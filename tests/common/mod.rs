// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures for the end-to-end suite: an in-memory deployment of
//! the full engine stack plus a scripted mailbox.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use despacho_bus::EventBus;
use despacho_core::{EventRecord, Shift, ShiftId, Slot, UserId};
use despacho_engine::print::ComandaRenderer;
use despacho_engine::{BatchProcessor, PrintManager, RenderError, ShiftManager, TextRenderer};
use despacho_ingest::{IngestError, MailConnector, Mailbox, RawMessage};
use despacho_store::{Store, assignment, catalogs, lotes, shifts};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A full in-memory deployment of the core.
pub struct Deployment {
    pub store: Store,
    pub bus: EventBus,
    pub processor: BatchProcessor,
    pub shifts: ShiftManager,
    pub printer: PrintManager,
    /// Keeps the PDF directory alive for the test's duration.
    pub pdf_dir: TempDir,
}

impl Deployment {
    pub async fn new() -> Self {
        Self::with_renderer(Arc::new(TextRenderer)).await
    }

    pub async fn with_renderer(renderer: Arc<dyn ComandaRenderer>) -> Self {
        let store = Store::connect_memory().await.expect("memory store");
        let bus = EventBus::new();
        let processor = BatchProcessor::new(store.clone(), bus.clone(), 80.0);
        let shifts = ShiftManager::new(store.clone(), bus.clone());
        let pdf_dir = TempDir::new().expect("tempdir");
        let printer = PrintManager::new(store.clone(), bus.clone(), renderer, pdf_dir.path());
        Self {
            store,
            bus,
            processor,
            shifts,
            printer,
            pdf_dir,
        }
    }

    /// Activate catalogs, configure the MORNING schedule, and open a shift
    /// with the given family-1 operator pool.
    pub async fn seed_and_open(&self, operators: &[UserId]) -> Shift {
        self.seed_catalogs(&[("LECHE", 1)], &["RUTA NORTE"]).await;
        let shift = self.open_shift(date(), Slot::Morning).await;
        self.enable_operators(shift.id, operators, 1).await;
        shift
    }

    pub async fn seed_catalogs(&self, products: &[(&str, i64)], routes: &[&str]) {
        let mut conn = self.store.pool().acquire().await.unwrap();
        let entries: Vec<(String, i64)> = products
            .iter()
            .map(|(name, family)| ((*name).to_string(), *family))
            .collect();
        let pv = catalogs::insert_products_catalog(&mut conn, &entries)
            .await
            .unwrap();
        catalogs::activate_products(&mut conn, pv, Utc::now())
            .await
            .unwrap();
        let names: Vec<String> = routes.iter().map(|r| (*r).to_string()).collect();
        let rv = catalogs::insert_routes_catalog(&mut conn, &names).await.unwrap();
        catalogs::activate_routes(&mut conn, rv, Utc::now())
            .await
            .unwrap();
    }

    pub async fn open_shift(&self, date: NaiveDate, slot: Slot) -> Shift {
        {
            let mut conn = self.store.pool().acquire().await.unwrap();
            shifts::upsert_schedule(&mut conn, slot, 23, 59).await.unwrap();
        }
        self.shifts.open_shift(slot, date, Some(1)).await.expect("open shift")
    }

    pub async fn enable_operators(&self, shift: ShiftId, operators: &[UserId], code: i64) {
        let mut conn = self.store.pool().acquire().await.unwrap();
        for op in operators {
            assignment::set_qualification(&mut conn, shift, *op, code, true)
                .await
                .unwrap();
        }
    }

    /// Ingest an email the way the worker would, then process it.
    pub async fn deliver_email(&self, uid: i64, subject: &str, body: &str) -> despacho_core::LoteId {
        let lote_id = self.store_raw_lote(uid, subject, body).await;
        self.processor.process_lote(lote_id).await.expect("process lote");
        lote_id
    }

    /// Materialize a raw lote without processing it.
    pub async fn store_raw_lote(
        &self,
        uid: i64,
        subject: &str,
        body: &str,
    ) -> despacho_core::LoteId {
        let mut conn = self.store.pool().acquire().await.unwrap();
        let shift = shifts::find_active(&mut conn).await.unwrap().expect("active shift");
        lotes::insert_ingested(
            &mut conn,
            &lotes::NewLote {
                uidvalidity: 1,
                uid,
                received_at: Utc::now(),
                subject_raw: subject.to_string(),
                body_raw: body.to_string(),
                shift_id: shift.id,
                parse_status: despacho_core::ParseStatus::Pending,
                parse_error: None,
            },
        )
        .await
        .unwrap()
        .expect("fresh uid")
    }

    /// Event types persisted so far, in append order.
    pub async fn event_types(&self) -> Vec<String> {
        let mut conn = self.store.pool().acquire().await.unwrap();
        despacho_store::events::replay(&mut conn, despacho_store::events::EventCursor::Id(0), 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    pub async fn events_of_type(&self, event_type: &str) -> Vec<EventRecord> {
        let mut conn = self.store.pool().acquire().await.unwrap();
        despacho_store::events::replay(&mut conn, despacho_store::events::EventCursor::Id(0), 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, 15).unwrap()
}

// ---------------------------------------------------------------------------
// Scripted mailbox
// ---------------------------------------------------------------------------

/// Mailbox state shared between the test and the worker.
#[derive(Debug, Default)]
pub struct MailboxScript {
    pub uidvalidity: i64,
    pub messages: Vec<RawMessage>,
}

/// A connector whose sessions serve a scripted message list.
#[derive(Clone, Default)]
pub struct ScriptedMail {
    script: Arc<Mutex<MailboxScript>>,
}

impl ScriptedMail {
    pub fn new(uidvalidity: i64) -> Self {
        let mail = Self::default();
        mail.script.lock().unwrap().uidvalidity = uidvalidity;
        mail
    }

    pub fn push_rfc822(&self, uid: i64, subject: &str, body: &str) {
        let source = format!("Subject: {subject}\r\n\r\n{body}").into_bytes();
        self.script.lock().unwrap().messages.push(RawMessage { uid, source });
    }

    pub fn push_raw(&self, uid: i64, source: &[u8]) {
        self.script.lock().unwrap().messages.push(RawMessage {
            uid,
            source: source.to_vec(),
        });
    }

    pub fn set_uidvalidity(&self, uidvalidity: i64) {
        self.script.lock().unwrap().uidvalidity = uidvalidity;
    }
}

#[async_trait]
impl MailConnector for ScriptedMail {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, IngestError> {
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<MailboxScript>>,
}

#[async_trait]
impl Mailbox for ScriptedSession {
    async fn select(&mut self, _folder: &str) -> Result<i64, IngestError> {
        Ok(self.script.lock().unwrap().uidvalidity)
    }

    async fn fetch_since(&mut self, last_uid: i64) -> Result<Vec<RawMessage>, IngestError> {
        let mut matching: Vec<RawMessage> = self
            .script
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.uid > last_uid)
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.uid);
        Ok(matching)
    }

    async fn logout(&mut self) -> Result<(), IngestError> {
        Ok(())
    }
}

/// A renderer that always fails, for the FAILED-job path.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokenRenderer;

#[async_trait]
impl ComandaRenderer for BrokenRenderer {
    async fn render(
        &self,
        _document: &despacho_engine::print::PrintDocument,
    ) -> Result<Vec<u8>, RenderError> {
        Err(RenderError("paper jam".to_string()))
    }
}
