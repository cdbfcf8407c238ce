// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

pub mod assignment;
pub mod catalogs;
pub mod events;
pub mod imap;
pub mod lotes;
pub mod orders;
pub mod print;
pub mod progress;
pub mod routes;
pub mod shifts;

/// Errors surfaced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database driver error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Migration runner error.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored enum value no longer parses.
    #[error("corrupt row: {0}")]
    Corrupt(#[from] despacho_core::InvalidValue),

    /// A stored decimal or timestamp no longer parses.
    #[error("corrupt {what} in column {column}: {raw:?}")]
    CorruptScalar {
        /// What kind of scalar (`"decimal"`, `"timestamp"`, `"date"`).
        what: &'static str,
        /// Column name.
        column: &'static str,
        /// Raw stored text.
        raw: String,
    },

    /// A stored event payload is not valid JSON.
    #[error("corrupt event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Shorthand result for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Owner of the connection pool and the migration runner.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the database at `url`, creating the file if needed, and
    /// run pending migrations.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Connect to a private in-memory database (tests). A single pinned
    /// connection keeps the data alive for the pool's lifetime.
    pub async fn connect_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

// ---------------------------------------------------------------------------
// Column codecs
//
// Timestamps are stored as RFC 3339 TEXT with fixed millisecond precision
// and a `Z` suffix, so lexicographic SQL comparison equals chronological
// comparison. Decimals are canonical TEXT.
// ---------------------------------------------------------------------------

pub(crate) fn ts_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_opt_to_sql(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts_to_sql)
}

pub(crate) fn col_ts(row: &SqliteRow, column: &'static str) -> StoreResult<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    parse_ts(column, &raw)
}

pub(crate) fn col_ts_opt(row: &SqliteRow, column: &'static str) -> StoreResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| parse_ts(column, &r)).transpose()
}

fn parse_ts(column: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::CorruptScalar {
            what: "timestamp",
            column,
            raw: raw.to_string(),
        })
}

pub(crate) fn col_date(row: &SqliteRow, column: &'static str) -> StoreResult<NaiveDate> {
    let raw: String = row.try_get(column)?;
    NaiveDate::from_str(&raw).map_err(|_| StoreError::CorruptScalar {
        what: "date",
        column,
        raw,
    })
}

pub(crate) fn col_enum<T>(row: &SqliteRow, column: &'static str) -> StoreResult<T>
where
    T: FromStr<Err = despacho_core::InvalidValue>,
{
    let raw: String = row.try_get(column)?;
    Ok(raw.parse()?)
}

pub(crate) fn col_enum_opt<T>(row: &SqliteRow, column: &'static str) -> StoreResult<Option<T>>
where
    T: FromStr<Err = despacho_core::InvalidValue>,
{
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.map(|r| r.parse()).transpose()?)
}

pub(crate) fn col_decimal(row: &SqliteRow, column: &'static str) -> StoreResult<Decimal> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|_| StoreError::CorruptScalar {
        what: "decimal",
        column,
        raw,
    })
}

pub(crate) fn col_decimal_opt(row: &SqliteRow, column: &'static str) -> StoreResult<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| {
        Decimal::from_str(&r).map_err(|_| StoreError::CorruptScalar {
            what: "decimal",
            column,
            raw: r,
        })
    })
    .transpose()
}
