// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mailbox ingest for the despacho backplane: a minimal IMAP4rev1 client
//! and the idempotent poll worker that materializes messages as lotes.
#![deny(unsafe_code)]

/// The IMAP client (LOGIN / SELECT / UID FETCH / LOGOUT).
pub mod client;
/// The transport seam and raw-message extraction.
pub mod transport;
/// The poll worker and its status handle.
pub mod worker;

pub use client::ImapConnector;
pub use transport::{ExtractedMessage, MailConnector, Mailbox, RawMessage, extract_message};
pub use worker::{ImapStatus, IngestHandle, IngestWorker};

use despacho_store::StoreError;

/// Errors raised by the ingest side.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Could not reach or authenticate against the server.
    #[error("connect: {0}")]
    Connect(String),

    /// The server said something the client does not accept.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
