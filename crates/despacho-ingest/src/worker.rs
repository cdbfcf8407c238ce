// SPDX-License-Identifier: MIT OR Apache-2.0
//! The ingest worker: one long-running task owns the mailbox connection
//! and runs poll cycles on a fixed interval or an explicit nudge.
//!
//! Reconnects with exponential backoff (1 s doubling to 60 s, reset on a
//! successful login). A single bad message never stalls the mailbox: it is
//! absorbed as an ERROR_PARSE lote and the cursor still advances.

use crate::transport::{MailConnector, Mailbox, extract_message};
use crate::IngestError;
use chrono::{DateTime, Utc};
use despacho_bus::{EventBus, TxnEvents};
use despacho_core::{EventDraft, EventType, LoteId, ParseStatus};
use despacho_engine::BatchProcessor;
use despacho_store::{Store, imap as cursor_rows, lotes, shifts};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Initial reconnect backoff.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const BACKOFF_CEIL: Duration = Duration::from_secs(60);

/// Snapshot served by `GET /api/imap/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImapStatus {
    /// Whether the worker task is alive.
    pub running: bool,
    /// Whether a session is currently established.
    pub connected: bool,
    /// Most recent transport error, if any.
    pub last_error: Option<String>,
    /// Last completed poll cycle.
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Persisted cursor: highest ingested UID.
    pub last_uid: i64,
    /// Persisted cursor: mailbox generation.
    pub uidvalidity: Option<i64>,
}

/// Handle held by the HTTP layer: status reads and "poll now" nudges.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    status: Arc<RwLock<ImapStatus>>,
    nudge_tx: mpsc::Sender<()>,
}

impl IngestHandle {
    /// Current worker status.
    pub async fn status(&self) -> ImapStatus {
        self.status.read().await.clone()
    }

    /// Request one immediate poll cycle. Returns `false` when the worker
    /// is gone or already has a nudge queued.
    pub fn nudge(&self) -> bool {
        self.nudge_tx.try_send(()).is_ok()
    }

    /// The nudge sender, for wiring into the shift manager.
    pub fn nudge_sender(&self) -> mpsc::Sender<()> {
        self.nudge_tx.clone()
    }
}

/// The worker task state.
pub struct IngestWorker {
    connector: Arc<dyn MailConnector>,
    store: Store,
    bus: EventBus,
    processor: BatchProcessor,
    folder: String,
    poll_interval: Duration,
    status: Arc<RwLock<ImapStatus>>,
    nudge_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl IngestWorker {
    /// Build the worker and its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn MailConnector>,
        store: Store,
        bus: EventBus,
        processor: BatchProcessor,
        folder: impl Into<String>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, IngestHandle) {
        let status = Arc::new(RwLock::new(ImapStatus {
            running: true,
            ..ImapStatus::default()
        }));
        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        let handle = IngestHandle {
            status: status.clone(),
            nudge_tx,
        };
        let worker = Self {
            connector,
            store,
            bus,
            processor,
            folder: folder.into(),
            poll_interval,
            status,
            nudge_rx,
            cancel,
        };
        (worker, handle)
    }

    /// Run until cancelled: connect, poll on tick or nudge, reconnect on
    /// error with backoff.
    pub async fn run(mut self) {
        let mut backoff = BACKOFF_FLOOR;
        'reconnect: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut session = match self.connector.connect().await {
                Ok(session) => {
                    backoff = BACKOFF_FLOOR;
                    self.set_connected(true, None).await;
                    info!(folder = %self.folder, "ingest connected");
                    session
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "ingest connect failed");
                    self.set_connected(false, Some(err.to_string())).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEIL);
                    continue 'reconnect;
                }
            };

            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        if let Err(err) = session.logout().await {
                            warn!(error = %err, "imap logout failed");
                        }
                        break 'reconnect;
                    }
                    _ = ticker.tick() => {}
                    Some(()) = self.nudge_rx.recv() => {}
                }

                if let Err(err) = self.poll_cycle(session.as_mut()).await {
                    error!(error = %err, "poll cycle failed; reconnecting");
                    self.set_connected(false, Some(err.to_string())).await;
                    continue 'reconnect;
                }
            }
        }

        let mut status = self.status.write().await;
        status.running = false;
        status.connected = false;
        info!("ingest worker stopped");
    }

    /// One poll cycle per the ingest contract. Skips the fetch entirely
    /// while no shift is active, but still records the poll instant.
    pub async fn poll_cycle(&self, session: &mut dyn Mailbox) -> Result<(), IngestError> {
        let now = Utc::now();
        // Connections are scoped tightly: the per-message transactions
        // below need the pool free.
        let (cursor, shift) = {
            let mut conn = self
                .store
                .pool()
                .acquire()
                .await
                .map_err(despacho_store::StoreError::from)?;
            let cursor = cursor_rows::load_cursor(&mut conn, &self.folder).await?;
            let shift = shifts::find_active(&mut conn).await?;
            let Some(shift) = shift else {
                cursor_rows::save_cursor(
                    &mut conn,
                    &self.folder,
                    cursor.last_uid,
                    cursor.uidvalidity,
                    Some(now),
                )
                .await?;
                drop(conn);
                self.publish_cursor(cursor.last_uid, cursor.uidvalidity, Some(now)).await;
                return Ok(());
            };
            (cursor, shift)
        };

        let uidvalidity = session.select(&self.folder).await?;
        let mut last_uid = cursor.last_uid;
        if let Some(known) = cursor.uidvalidity {
            if known != uidvalidity {
                warn!(
                    known,
                    current = uidvalidity,
                    "uidvalidity changed; resetting cursor and re-ingesting"
                );
                last_uid = 0;
                let mut conn = self
                    .store
                    .pool()
                    .acquire()
                    .await
                    .map_err(despacho_store::StoreError::from)?;
                cursor_rows::save_cursor(&mut conn, &self.folder, 0, None, cursor.last_poll_at)
                    .await?;
            }
        }

        let messages = session.fetch_since(last_uid).await?;
        let mut to_process: Vec<LoteId> = Vec::new();
        for message in messages {
            // One transaction per message; a duplicate pair inserts
            // nothing and only publishes DUPLICATE_IGNORED.
            let mut tx = self.store.begin().await.map_err(despacho_store::StoreError::from)?;
            let mut events = TxnEvents::new();

            let (parse_status, parse_error, subject, body) = match extract_message(&message.source)
            {
                Ok(extracted) => (ParseStatus::Pending, None, extracted.subject, extracted.body),
                Err(reason) => (
                    ParseStatus::ErrorParse,
                    Some(reason),
                    String::new(),
                    String::from_utf8_lossy(&message.source).into_owned(),
                ),
            };

            let inserted = lotes::insert_ingested(
                &mut tx,
                &lotes::NewLote {
                    uidvalidity,
                    uid: message.uid,
                    received_at: now,
                    subject_raw: subject,
                    body_raw: body,
                    shift_id: shift.id,
                    parse_status,
                    parse_error: parse_error.clone(),
                },
            )
            .await?;

            match inserted {
                None => {
                    events
                        .append(
                            &mut tx,
                            &EventDraft::new(EventType::DuplicateIgnored, "imap", message.uid)
                                .payload(json!({
                                    "uidvalidity": uidvalidity,
                                    "uid": message.uid,
                                })),
                        )
                        .await?;
                }
                Some(lote_id) => match parse_error {
                    None => {
                        events
                            .append(
                                &mut tx,
                                &EventDraft::new(EventType::NewEmail, "lote", lote_id).payload(
                                    json!({
                                        "uidvalidity": uidvalidity,
                                        "uid": message.uid,
                                    }),
                                ),
                            )
                            .await?;
                        to_process.push(lote_id);
                    }
                    Some(reason) => {
                        events
                            .append(
                                &mut tx,
                                &EventDraft::new(EventType::EmailReadError, "lote", lote_id)
                                    .payload(json!({
                                        "uid": message.uid,
                                        "error": reason,
                                    })),
                            )
                            .await?;
                    }
                },
            }

            tx.commit().await.map_err(despacho_store::StoreError::from)?;
            events.flush(&self.bus);
            last_uid = last_uid.max(message.uid);
        }

        {
            let mut conn = self
                .store
                .pool()
                .acquire()
                .await
                .map_err(despacho_store::StoreError::from)?;
            cursor_rows::save_cursor(&mut conn, &self.folder, last_uid, Some(uidvalidity), Some(now))
                .await?;
        }
        self.publish_cursor(last_uid, Some(uidvalidity), Some(now)).await;

        // Processing happens outside the per-message transactions; a
        // failing lote records its own error state.
        for lote_id in to_process {
            if let Err(err) = self.processor.process_lote(lote_id).await {
                warn!(lote_id, error = %err, "lote left in error state");
            }
        }
        Ok(())
    }

    async fn set_connected(&self, connected: bool, error: Option<String>) {
        let mut status = self.status.write().await;
        status.connected = connected;
        if error.is_some() {
            status.last_error = error;
        }
    }

    async fn publish_cursor(
        &self,
        last_uid: i64,
        uidvalidity: Option<i64>,
        last_poll_at: Option<DateTime<Utc>>,
    ) {
        let mut status = self.status.write().await;
        status.connected = true;
        status.last_uid = last_uid;
        status.uidvalidity = uidvalidity;
        status.last_poll_at = last_poll_at;
    }
}
