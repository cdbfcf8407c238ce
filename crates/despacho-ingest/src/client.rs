// SPDX-License-Identifier: MIT OR Apache-2.0
//! A minimal IMAP4rev1 client: exactly the command subset the ingest loop
//! needs (LOGIN, SELECT with UIDVALIDITY, UID FETCH of raw sources,
//! LOGOUT), over plain TCP or TLS. No IDLE.

use crate::transport::{MailConnector, Mailbox, RawMessage};
use crate::IngestError;
use async_trait::async_trait;
use despacho_config::ImapConfig;
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Plain-TCP or TLS-wrapped connection; both variants are `Unpin`.
enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connects and authenticates IMAP sessions per the configured mailbox.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    /// Build a connector for the configured mailbox.
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, IngestError> {
        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| IngestError::Connect(format!("tcp connect: {e}")))?;

        let stream = if self.config.secure {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let server_name = ServerName::try_from(self.config.host.clone())
                .map_err(|e| IngestError::Connect(format!("server name: {e}")))?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| IngestError::Connect(format!("tls handshake: {e}")))?;
            MailStream::Tls(Box::new(tls))
        } else {
            MailStream::Plain(tcp)
        };

        let mut client = ImapClient {
            stream: BufReader::new(stream),
            tag_seq: 0,
        };
        // Server greeting comes unsolicited.
        let greeting = client.read_line().await?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(IngestError::Protocol(format!("bad greeting: {greeting}")));
        }
        client
            .command(&format!(
                "LOGIN {} {}",
                quote(&self.config.user),
                quote(&self.config.password)
            ))
            .await?;
        debug!(host = %self.config.host, "imap session authenticated");
        Ok(Box::new(client))
    }
}

/// Quote an IMAP string literal-ish; good enough for user/password values.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One authenticated IMAP session.
pub struct ImapClient {
    stream: BufReader<MailStream>,
    tag_seq: u64,
}

impl ImapClient {
    async fn read_line(&mut self) -> Result<String, IngestError> {
        let mut raw = Vec::new();
        let n = self.stream.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(IngestError::Protocol("connection closed".into()));
        }
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn send(&mut self, tag: &str, cmd: &str) -> Result<(), IngestError> {
        self.stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn next_tag(&mut self) -> String {
        self.tag_seq += 1;
        format!("a{:04}", self.tag_seq)
    }

    /// Send a command; collect untagged lines until the tagged completion,
    /// which must be OK.
    async fn command(&mut self, cmd: &str) -> Result<Vec<String>, IngestError> {
        let tag = self.next_tag();
        self.send(&tag, cmd).await?;
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line().await?;
            if let Some(rest) = line.strip_prefix(&format!("{tag} ")) {
                if rest.starts_with("OK") {
                    return Ok(untagged);
                }
                return Err(IngestError::Protocol(format!("command failed: {rest}")));
            }
            untagged.push(line);
        }
    }

    /// `{n}` literal marker at the end of a response line.
    fn literal_size(line: &str) -> Option<usize> {
        let open = line.rfind('{')?;
        let close = line.rfind('}')?;
        if close != line.len() - 1 || close <= open {
            return None;
        }
        line[open + 1..close].parse().ok()
    }

    fn parse_uid(segment: &str) -> Option<i64> {
        let idx = segment.find("UID ")?;
        let rest = &segment[idx + 4..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }
}

#[async_trait]
impl Mailbox for ImapClient {
    async fn select(&mut self, folder: &str) -> Result<i64, IngestError> {
        let untagged = self.command(&format!("SELECT {}", quote(folder))).await?;
        for line in &untagged {
            if let Some(idx) = line.find("[UIDVALIDITY ") {
                let rest = &line[idx + "[UIDVALIDITY ".len()..];
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                if let Ok(v) = digits.parse() {
                    return Ok(v);
                }
            }
        }
        Err(IngestError::Protocol("SELECT reported no UIDVALIDITY".into()))
    }

    async fn fetch_since(&mut self, last_uid: i64) -> Result<Vec<RawMessage>, IngestError> {
        let tag = self.next_tag();
        self.send(&tag, &format!("UID FETCH {}:* (RFC822)", last_uid + 1))
            .await?;

        let mut messages = Vec::new();
        loop {
            let line = self.read_line().await?;
            if let Some(rest) = line.strip_prefix(&format!("{tag} ")) {
                if rest.starts_with("OK") {
                    break;
                }
                return Err(IngestError::Protocol(format!("fetch failed: {rest}")));
            }
            if !(line.starts_with("* ") && line.contains("FETCH")) {
                continue;
            }

            // Unsolicited FETCH updates (flag changes) carry no literal;
            // only responses with a message body are ingested.
            let Some(size) = Self::literal_size(&line) else {
                continue;
            };
            let mut source = vec![0u8; size];
            self.stream.read_exact(&mut source).await?;
            // The rest of the FETCH response (closing parenthesis,
            // possibly trailing data items such as UID) follows the
            // literal.
            let trailer = self.read_line().await?;
            let mut descriptor = line.clone();
            descriptor.push(' ');
            descriptor.push_str(&trailer);

            let Some(uid) = Self::parse_uid(&descriptor) else {
                return Err(IngestError::Protocol(format!(
                    "FETCH response without UID: {descriptor}"
                )));
            };
            // `n:*` always matches at least the last message; skip
            // anything at or below the cursor.
            if uid > last_uid {
                messages.push(RawMessage { uid, source });
            }
        }
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    async fn logout(&mut self) -> Result<(), IngestError> {
        self.command("LOGOUT").await.map(|_| ())
    }
}
