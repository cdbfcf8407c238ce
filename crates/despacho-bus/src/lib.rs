// SPDX-License-Identifier: MIT OR Apache-2.0
//! The event bus: persist-first publishing over the append-only log, with
//! bounded in-process fan-out to live subscribers.
//!
//! Persistence always happens first; fan-out is best effort. A slow
//! subscriber only drops events from its own buffer (the log still has
//! them for replay) and never blocks the writer.
#![deny(unsafe_code)]

use despacho_core::{EventDraft, EventRecord};
use despacho_store::{StoreResult, events};
use sqlx::SqliteConnection;
use tokio::sync::broadcast;
use tracing::debug;

/// Per-subscriber buffer size; overflow drops on the slow subscriber.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// One broadcaster, many subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the standard subscriber buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// Attach a live subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver an already-persisted event to live subscribers. Send
    /// failures mean nobody is listening, which is fine.
    pub fn fan_out(&self, event: &EventRecord) {
        if self.tx.send(event.clone()).is_err() {
            debug!(event_type = %event.event_type, "no live subscribers");
        }
    }

    /// Append to the log and fan out immediately. For call sites that are
    /// not inside a transaction; within one, use [`TxnEvents`].
    pub async fn publish(
        &self,
        conn: &mut SqliteConnection,
        draft: &EventDraft,
    ) -> StoreResult<EventRecord> {
        let record = events::append(conn, draft).await?;
        self.fan_out(&record);
        Ok(record)
    }
}

/// Buffer for events appended inside a transaction. Rows are written with
/// the transaction (so they commit or roll back with it); fan-out happens
/// only after commit, via [`TxnEvents::flush`].
#[derive(Debug, Default)]
pub struct TxnEvents {
    buffered: Vec<EventRecord>,
}

impl TxnEvents {
    /// Start an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the event row on the transaction connection and buffer the
    /// record for post-commit fan-out.
    pub async fn append(
        &mut self,
        conn: &mut SqliteConnection,
        draft: &EventDraft,
    ) -> StoreResult<()> {
        let record = events::append(conn, draft).await?;
        self.buffered.push(record);
        Ok(())
    }

    /// The buffered records, in append order.
    pub fn records(&self) -> &[EventRecord] {
        &self.buffered
    }

    /// Fan out everything buffered. Call after the transaction committed;
    /// on rollback, just drop the buffer.
    pub fn flush(self, bus: &EventBus) {
        for record in &self.buffered {
            bus.fan_out(record);
        }
    }
}
