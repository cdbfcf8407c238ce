// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioned, immutable product and route catalogs.
//!
//! Content upload and validation live outside the core; this module owns
//! the version rows, the single-active flip, and the ordered reads the
//! matcher depends on (alphabetical by `norm_name`).

use crate::{StoreResult, events, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{CatalogProduct, CatalogVersion, EventDraft, EventRecord, EventType};
use sqlx::{Row, SqliteConnection};

/// Create a new products catalog version from `(norm_name, family)` pairs.
/// Entries are stored in alphabetical order; the new version is inactive.
pub async fn insert_products_catalog(
    conn: &mut SqliteConnection,
    entries: &[(String, i64)],
) -> StoreResult<CatalogVersion> {
    let res = sqlx::query("INSERT INTO products_catalogs (active) VALUES (0)")
        .execute(&mut *conn)
        .await?;
    let version = res.last_insert_rowid();

    let mut sorted: Vec<&(String, i64)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (norm_name, family) in sorted {
        sqlx::query("INSERT INTO products (catalog_version, norm_name, family) VALUES (?, ?, ?)")
            .bind(version)
            .bind(norm_name)
            .bind(family)
            .execute(&mut *conn)
            .await?;
    }
    Ok(version)
}

/// Flip the single active bit to `version` and record the activation event.
pub async fn activate_products(
    conn: &mut SqliteConnection,
    version: CatalogVersion,
    now: DateTime<Utc>,
) -> StoreResult<EventRecord> {
    sqlx::query("UPDATE products_catalogs SET active = 0 WHERE active = 1")
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE products_catalogs SET active = 1, activated_at = ? WHERE version = ?")
        .bind(ts_to_sql(now))
        .bind(version)
        .execute(&mut *conn)
        .await?;
    events::append(
        conn,
        &EventDraft::new(EventType::ProductsActivated, "catalog", version),
    )
    .await
}

/// The active products catalog version, if one has been activated.
pub async fn active_products_version(
    conn: &mut SqliteConnection,
) -> StoreResult<Option<CatalogVersion>> {
    let v = sqlx::query_scalar("SELECT version FROM products_catalogs WHERE active = 1")
        .fetch_optional(conn)
        .await?;
    Ok(v)
}

/// Products of a version, in the alphabetical scan order the fuzzy
/// tie-break contract relies on.
pub async fn products_for(
    conn: &mut SqliteConnection,
    version: CatalogVersion,
) -> StoreResult<Vec<CatalogProduct>> {
    let rows = sqlx::query(
        "SELECT id, norm_name, family FROM products WHERE catalog_version = ? ORDER BY norm_name",
    )
    .bind(version)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(CatalogProduct {
                id: row.try_get("id")?,
                norm_name: row.try_get("norm_name")?,
                family: row.try_get("family")?,
            })
        })
        .collect()
}

/// Create a new routes catalog version from normalized route names.
pub async fn insert_routes_catalog(
    conn: &mut SqliteConnection,
    route_names: &[String],
) -> StoreResult<CatalogVersion> {
    let res = sqlx::query("INSERT INTO routes_catalogs (active) VALUES (0)")
        .execute(&mut *conn)
        .await?;
    let version = res.last_insert_rowid();

    let mut sorted: Vec<&String> = route_names.iter().collect();
    sorted.sort();
    for name in sorted {
        sqlx::query("INSERT INTO routes (catalog_version, norm_name) VALUES (?, ?)")
            .bind(version)
            .bind(name)
            .execute(&mut *conn)
            .await?;
    }
    Ok(version)
}

/// Flip the single active bit to `version` and record the activation event.
pub async fn activate_routes(
    conn: &mut SqliteConnection,
    version: CatalogVersion,
    now: DateTime<Utc>,
) -> StoreResult<EventRecord> {
    sqlx::query("UPDATE routes_catalogs SET active = 0 WHERE active = 1")
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE routes_catalogs SET active = 1, activated_at = ? WHERE version = ?")
        .bind(ts_to_sql(now))
        .bind(version)
        .execute(&mut *conn)
        .await?;
    events::append(
        conn,
        &EventDraft::new(EventType::RoutesActivated, "catalog", version),
    )
    .await
}

/// The active routes catalog version, if one has been activated.
pub async fn active_routes_version(
    conn: &mut SqliteConnection,
) -> StoreResult<Option<CatalogVersion>> {
    let v = sqlx::query_scalar("SELECT version FROM routes_catalogs WHERE active = 1")
        .fetch_optional(conn)
        .await?;
    Ok(v)
}

/// Normalized route names of a version, alphabetical.
pub async fn route_names(
    conn: &mut SqliteConnection,
    version: CatalogVersion,
) -> StoreResult<Vec<String>> {
    let names =
        sqlx::query_scalar("SELECT norm_name FROM routes WHERE catalog_version = ? ORDER BY norm_name")
            .bind(version)
            .fetch_all(conn)
            .await?;
    Ok(names)
}
