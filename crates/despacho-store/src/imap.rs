// SPDX-License-Identifier: MIT OR Apache-2.0
//! The persisted IMAP poll cursor. One row per mailbox; the ingest worker
//! is its only writer.

use crate::{StoreResult, col_ts_opt, ts_opt_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::ImapCursor;
use sqlx::{Row, SqliteConnection};

/// Load the cursor for `mailbox`, defaulting to `(0, None)` when the row
/// does not exist yet.
pub async fn load_cursor(conn: &mut SqliteConnection, mailbox: &str) -> StoreResult<ImapCursor> {
    let row = sqlx::query("SELECT * FROM imap_cursors WHERE mailbox = ?")
        .bind(mailbox)
        .fetch_optional(conn)
        .await?;
    match row {
        Some(row) => Ok(ImapCursor {
            mailbox: row.try_get("mailbox")?,
            last_uid: row.try_get("last_uid")?,
            uidvalidity: row.try_get("uidvalidity")?,
            last_poll_at: col_ts_opt(&row, "last_poll_at")?,
        }),
        None => Ok(ImapCursor {
            mailbox: mailbox.to_string(),
            last_uid: 0,
            uidvalidity: None,
            last_poll_at: None,
        }),
    }
}

/// Persist the cursor after a poll cycle (or a uidvalidity reset).
pub async fn save_cursor(
    conn: &mut SqliteConnection,
    mailbox: &str,
    last_uid: i64,
    uidvalidity: Option<i64>,
    last_poll_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO imap_cursors (mailbox, last_uid, uidvalidity, last_poll_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (mailbox) DO UPDATE SET last_uid = excluded.last_uid,
             uidvalidity = excluded.uidvalidity, last_poll_at = excluded.last_poll_at",
    )
    .bind(mailbox)
    .bind(last_uid)
    .bind(uidvalidity)
    .bind(ts_opt_to_sql(last_poll_at))
    .execute(conn)
    .await?;
    Ok(())
}
