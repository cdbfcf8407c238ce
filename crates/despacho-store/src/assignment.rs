// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rows behind the operator-assignment engine: per-shift qualification
//! pools, sticky client affinities, and round-robin cursors.

use crate::StoreResult;
use despacho_core::{ShiftId, UserId};
use sqlx::SqliteConnection;

/// Enable or disable a `(shift, user, functional_code)` qualification.
pub async fn set_qualification(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    user: UserId,
    functional_code: i64,
    enabled: bool,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO shift_qualifications (shift_id, user_id, functional_code, enabled)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (shift_id, user_id, functional_code)
         DO UPDATE SET enabled = excluded.enabled",
    )
    .bind(shift_id)
    .bind(user)
    .bind(functional_code)
    .bind(enabled as i64)
    .execute(conn)
    .await?;
    Ok(())
}

/// The ordered pool for a functional code: enabled operators, ascending id.
pub async fn pool_for(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    functional_code: i64,
) -> StoreResult<Vec<UserId>> {
    let users = sqlx::query_scalar(
        "SELECT user_id FROM shift_qualifications
         WHERE shift_id = ? AND functional_code = ? AND enabled = 1
         ORDER BY user_id",
    )
    .bind(shift_id)
    .bind(functional_code)
    .fetch_all(conn)
    .await?;
    Ok(users)
}

/// One qualification row of a shift's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualification {
    /// Qualified user.
    pub user_id: UserId,
    /// Functional code (1–6).
    pub functional_code: i64,
    /// Whether the qualification is in force.
    pub enabled: bool,
}

/// Every qualification row of a shift, for the configuration view.
pub async fn list_qualifications(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
) -> StoreResult<Vec<Qualification>> {
    use sqlx::Row;
    let rows = sqlx::query(
        "SELECT user_id, functional_code, enabled FROM shift_qualifications
         WHERE shift_id = ? ORDER BY functional_code, user_id",
    )
    .bind(shift_id)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(Qualification {
                user_id: row.try_get("user_id")?,
                functional_code: row.try_get("functional_code")?,
                enabled: row.try_get::<i64, _>("enabled")? != 0,
            })
        })
        .collect()
}

/// The sticky operator for `(shift, affinity_key, functional_code)`.
pub async fn affinity_for(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    affinity_key: &str,
    functional_code: i64,
) -> StoreResult<Option<UserId>> {
    let user = sqlx::query_scalar(
        "SELECT operator_user FROM owner_affinities
         WHERE shift_id = ? AND affinity_key = ? AND functional_code = ?",
    )
    .bind(shift_id)
    .bind(affinity_key)
    .bind(functional_code)
    .fetch_optional(conn)
    .await?;
    Ok(user)
}

/// Bind (or rebind) the sticky operator for an affinity key.
pub async fn upsert_affinity(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    affinity_key: &str,
    functional_code: i64,
    operator: UserId,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO owner_affinities (shift_id, affinity_key, functional_code, operator_user)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (shift_id, affinity_key, functional_code)
         DO UPDATE SET operator_user = excluded.operator_user",
    )
    .bind(shift_id)
    .bind(affinity_key)
    .bind(functional_code)
    .bind(operator)
    .execute(conn)
    .await?;
    Ok(())
}

/// Last operator handed out by round-robin for `(shift, functional_code)`.
pub async fn cursor_for(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    functional_code: i64,
) -> StoreResult<Option<UserId>> {
    let user: Option<Option<UserId>> = sqlx::query_scalar(
        "SELECT last_operator FROM round_robin_cursors
         WHERE shift_id = ? AND functional_code = ?",
    )
    .bind(shift_id)
    .bind(functional_code)
    .fetch_optional(conn)
    .await?;
    Ok(user.flatten())
}

/// Advance the round-robin cursor.
pub async fn set_cursor(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    functional_code: i64,
    operator: UserId,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO round_robin_cursors (shift_id, functional_code, last_operator)
         VALUES (?, ?, ?)
         ON CONFLICT (shift_id, functional_code)
         DO UPDATE SET last_operator = excluded.last_operator",
    )
    .bind(shift_id)
    .bind(functional_code)
    .bind(operator)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Store, shifts};
    use chrono::{NaiveDate, Utc};
    use despacho_core::Slot;

    async fn shift(conn: &mut SqliteConnection) -> ShiftId {
        let date = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let id = shifts::insert(conn, date, Slot::Morning).await.unwrap();
        let now = Utc::now();
        shifts::activate(conn, id, now, now).await.unwrap();
        id
    }

    #[tokio::test]
    async fn pool_orders_by_user_and_honors_enabled() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let s = shift(&mut conn).await;

        set_qualification(&mut conn, s, 30, 1, true).await.unwrap();
        set_qualification(&mut conn, s, 10, 1, true).await.unwrap();
        set_qualification(&mut conn, s, 20, 1, true).await.unwrap();
        set_qualification(&mut conn, s, 40, 2, true).await.unwrap();
        assert_eq!(pool_for(&mut conn, s, 1).await.unwrap(), vec![10, 20, 30]);

        set_qualification(&mut conn, s, 20, 1, false).await.unwrap();
        assert_eq!(pool_for(&mut conn, s, 1).await.unwrap(), vec![10, 30]);
        assert!(pool_for(&mut conn, s, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn affinity_and_cursor_upsert() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let s = shift(&mut conn).await;

        assert!(
            affinity_for(&mut conn, s, "SUPER UNO", 1)
                .await
                .unwrap()
                .is_none()
        );
        upsert_affinity(&mut conn, s, "SUPER UNO", 1, 10).await.unwrap();
        upsert_affinity(&mut conn, s, "SUPER UNO", 1, 30).await.unwrap();
        assert_eq!(
            affinity_for(&mut conn, s, "SUPER UNO", 1).await.unwrap(),
            Some(30)
        );

        assert!(cursor_for(&mut conn, s, 1).await.unwrap().is_none());
        set_cursor(&mut conn, s, 1, 10).await.unwrap();
        set_cursor(&mut conn, s, 1, 30).await.unwrap();
        assert_eq!(cursor_for(&mut conn, s, 1).await.unwrap(), Some(30));
    }
}
