// SPDX-License-Identifier: MIT OR Apache-2.0
//! The mailbox transport seam and raw-message extraction.
//!
//! The worker talks to a [`MailConnector`] that hands out live
//! [`Mailbox`] sessions; production wires the IMAP client, tests wire a
//! scripted mailbox.

use crate::IngestError;
use async_trait::async_trait;

/// One raw message as fetched from the mailbox.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Message UID within the selected folder's generation.
    pub uid: i64,
    /// Raw RFC 822 source.
    pub source: Vec<u8>,
}

/// A live, authenticated mailbox session.
#[async_trait]
pub trait Mailbox: Send {
    /// Select a folder and return its current `UIDVALIDITY`.
    async fn select(&mut self, folder: &str) -> Result<i64, IngestError>;

    /// Fetch messages with `uid > last_uid`, ascending.
    async fn fetch_since(&mut self, last_uid: i64) -> Result<Vec<RawMessage>, IngestError>;

    /// Log out and close the connection.
    async fn logout(&mut self) -> Result<(), IngestError>;
}

/// Creates mailbox sessions; the worker reconnects through this after any
/// failure.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Establish and authenticate a new session.
    async fn connect(&self) -> Result<Box<dyn Mailbox>, IngestError>;
}

/// Subject and body pulled out of a raw RFC 822 source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMessage {
    /// Unfolded `Subject:` header value (empty when absent).
    pub subject: String,
    /// Everything after the first blank-line separator. No MIME decoding.
    pub body: String,
}

/// Extract subject and body. The header block ends at the first blank
/// line; folded header continuations are unfolded with a single space.
pub fn extract_message(source: &[u8]) -> Result<ExtractedMessage, String> {
    let text = String::from_utf8_lossy(source);
    let (headers, body) = match split_headers(&text) {
        Some(parts) => parts,
        None => return Err("no header/body separator".to_string()),
    };

    let mut subject: Option<String> = None;
    let mut in_subject = false;
    for line in headers.lines() {
        if (line.starts_with(' ') || line.starts_with('\t')) && in_subject {
            if let Some(s) = subject.as_mut() {
                s.push(' ');
                s.push_str(line.trim());
            }
            continue;
        }
        in_subject = false;
        if let Some(rest) = strip_header(line, "Subject:") {
            subject = Some(rest.trim().to_string());
            in_subject = true;
        }
    }

    Ok(ExtractedMessage {
        subject: subject.unwrap_or_default(),
        body: body.to_string(),
    })
}

/// Split at the first blank line, tolerating both CRLF and LF sources.
fn split_headers(text: &str) -> Option<(&str, &str)> {
    if let Some(idx) = text.find("\r\n\r\n") {
        return Some((&text[..idx], &text[idx + 4..]));
    }
    text.find("\n\n").map(|idx| (&text[..idx], &text[idx + 2..]))
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (head, rest) = line.split_at_checked(name.len())?;
    head.eq_ignore_ascii_case(name).then_some(rest)
}
