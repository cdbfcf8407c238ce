// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shifts and per-slot schedules.

use crate::{StoreResult, col_date, col_enum, col_ts_opt, ts_to_sql};
use chrono::{DateTime, NaiveDate, Utc};
use despacho_core::{Schedule, Shift, ShiftId, Slot};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;

fn map_shift(row: &SqliteRow) -> StoreResult<Shift> {
    use sqlx::Row;
    Ok(Shift {
        id: row.try_get("id")?,
        date: col_date(row, "date")?,
        slot: col_enum(row, "slot")?,
        state: col_enum(row, "state")?,
        started_at: col_ts_opt(row, "started_at")?,
        scheduled_end_at: col_ts_opt(row, "scheduled_end_at")?,
        ended_at: col_ts_opt(row, "ended_at")?,
    })
}

/// The shift currently in ACTIVE state, if any.
pub async fn find_active(conn: &mut SqliteConnection) -> StoreResult<Option<Shift>> {
    let row = sqlx::query("SELECT * FROM shifts WHERE state = 'ACTIVE'")
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_shift).transpose()
}

/// Fetch one shift by id.
pub async fn get(conn: &mut SqliteConnection, id: ShiftId) -> StoreResult<Option<Shift>> {
    let row = sqlx::query("SELECT * FROM shifts WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_shift).transpose()
}

/// Whether a `(date, slot)` shift row already exists.
pub async fn exists(conn: &mut SqliteConnection, date: NaiveDate, slot: Slot) -> StoreResult<bool> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shifts WHERE date = ? AND slot = ?")
        .bind(date.to_string())
        .bind(slot.as_str())
        .fetch_one(conn)
        .await?;
    Ok(n > 0)
}

/// Insert a CREATED shift row.
pub async fn insert(
    conn: &mut SqliteConnection,
    date: NaiveDate,
    slot: Slot,
) -> StoreResult<ShiftId> {
    let res = sqlx::query("INSERT INTO shifts (date, slot, state) VALUES (?, ?, 'CREATED')")
        .bind(date.to_string())
        .bind(slot.as_str())
        .execute(conn)
        .await?;
    Ok(res.last_insert_rowid())
}

/// CREATED → ACTIVE. The partial unique index on `state` rejects a second
/// concurrent activation.
pub async fn activate(
    conn: &mut SqliteConnection,
    id: ShiftId,
    started_at: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE shifts SET state = 'ACTIVE', started_at = ?, scheduled_end_at = ? WHERE id = ?",
    )
    .bind(ts_to_sql(started_at))
    .bind(ts_to_sql(scheduled_end_at))
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// ACTIVE → CLOSED.
pub async fn close(
    conn: &mut SqliteConnection,
    id: ShiftId,
    ended_at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("UPDATE shifts SET state = 'CLOSED', ended_at = ? WHERE id = ?")
        .bind(ts_to_sql(ended_at))
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Most recently closed shift; the carryover source.
pub async fn latest_closed(conn: &mut SqliteConnection) -> StoreResult<Option<Shift>> {
    let row = sqlx::query(
        "SELECT * FROM shifts WHERE state = 'CLOSED' ORDER BY ended_at DESC, id DESC LIMIT 1",
    )
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(map_shift).transpose()
}

fn map_schedule(row: &SqliteRow) -> StoreResult<Schedule> {
    use sqlx::Row;
    Ok(Schedule {
        slot: col_enum(row, "slot")?,
        active: row.try_get::<i64, _>("active")? != 0,
        end_hour: row.try_get("end_hour")?,
        end_minute: row.try_get("end_minute")?,
    })
}

/// The active schedule row for a slot, if configured.
pub async fn find_schedule(
    conn: &mut SqliteConnection,
    slot: Slot,
) -> StoreResult<Option<Schedule>> {
    let row = sqlx::query("SELECT * FROM schedules WHERE slot = ? AND active = 1")
        .bind(slot.as_str())
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_schedule).transpose()
}

/// Create or replace a schedule row (maintained by external masterdata
/// tooling; exposed here for seeding).
pub async fn upsert_schedule(
    conn: &mut SqliteConnection,
    slot: Slot,
    end_hour: i64,
    end_minute: i64,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO schedules (slot, active, end_hour, end_minute) VALUES (?, 1, ?, ?)
         ON CONFLICT (slot) DO UPDATE SET active = 1, end_hour = excluded.end_hour,
         end_minute = excluded.end_minute",
    )
    .bind(slot.as_str())
    .bind(end_hour)
    .bind(end_minute)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use despacho_core::ShiftState;

    #[tokio::test]
    async fn shift_lifecycle_roundtrip() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();

        assert!(!exists(&mut conn, date, Slot::Morning).await.unwrap());
        let id = insert(&mut conn, date, Slot::Morning).await.unwrap();
        assert!(exists(&mut conn, date, Slot::Morning).await.unwrap());
        assert!(find_active(&mut conn).await.unwrap().is_none());

        let now = Utc::now();
        activate(&mut conn, id, now, now + chrono::Duration::hours(8))
            .await
            .unwrap();
        let active = find_active(&mut conn).await.unwrap().unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.state, ShiftState::Active);
        assert_eq!(active.slot, Slot::Morning);

        close(&mut conn, id, now + chrono::Duration::hours(8))
            .await
            .unwrap();
        assert!(find_active(&mut conn).await.unwrap().is_none());
        let closed = latest_closed(&mut conn).await.unwrap().unwrap();
        assert_eq!(closed.id, id);
    }

    #[tokio::test]
    async fn single_active_enforced_by_index() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let now = Utc::now();

        let a = insert(&mut conn, date, Slot::Morning).await.unwrap();
        let b = insert(&mut conn, date, Slot::Afternoon).await.unwrap();
        activate(&mut conn, a, now, now).await.unwrap();
        assert!(activate(&mut conn, b, now, now).await.is_err());
    }

    #[tokio::test]
    async fn schedule_upsert_and_lookup() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        assert!(
            find_schedule(&mut conn, Slot::Night)
                .await
                .unwrap()
                .is_none()
        );
        upsert_schedule(&mut conn, Slot::Night, 6, 30).await.unwrap();
        upsert_schedule(&mut conn, Slot::Night, 7, 0).await.unwrap();
        let sched = find_schedule(&mut conn, Slot::Night).await.unwrap().unwrap();
        assert_eq!((sched.end_hour, sched.end_minute), (7, 0));
        assert!(sched.active);
    }
}
