// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operator assignment: pool lookup, sticky client affinity, round-robin
//! rotation.
//!
//! Within one shift and functional code the same client always lands on
//! the same operator for as long as that operator stays in the pool;
//! everything else rotates deterministically. Callers run this inside
//! their own transaction, so cursor and affinity updates serialize on the
//! row locks.
#![deny(unsafe_code)]

use despacho_core::{AssignmentReason, ShiftId, UserId};
use despacho_norm::norm;
use despacho_store::{StoreResult, assignment as rows};
use sqlx::SqliteConnection;
use tracing::debug;

/// The outcome of one assignment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// The chosen operator; `None` only with an empty pool.
    pub operator: Option<UserId>,
    /// Which rule produced the choice.
    pub reason: AssignmentReason,
}

/// Assign an operator for one line.
pub async fn assign_operator(
    conn: &mut SqliteConnection,
    shift_id: ShiftId,
    client_name_raw: &str,
    functional_code: i64,
) -> StoreResult<Assignment> {
    let affinity_key = norm(client_name_raw);

    let pool = rows::pool_for(conn, shift_id, functional_code).await?;
    if pool.is_empty() {
        debug!(shift_id, functional_code, "empty operator pool");
        return Ok(Assignment {
            operator: None,
            reason: AssignmentReason::NoPool,
        });
    }

    // Sticky binding, honored only while its operator is still pooled.
    if let Some(bound) = rows::affinity_for(conn, shift_id, &affinity_key, functional_code).await? {
        if pool.contains(&bound) {
            return Ok(Assignment {
                operator: Some(bound),
                reason: AssignmentReason::Affinity,
            });
        }
    }

    let last = rows::cursor_for(conn, shift_id, functional_code).await?;
    let next = next_in_pool(&pool, last);
    rows::set_cursor(conn, shift_id, functional_code, next).await?;
    rows::upsert_affinity(conn, shift_id, &affinity_key, functional_code, next).await?;
    debug!(shift_id, functional_code, operator = next, "round-robin pick");

    Ok(Assignment {
        operator: Some(next),
        reason: AssignmentReason::RoundRobin,
    })
}

/// The pool element right after `last`, wrapping; the first element when
/// `last` is unset or no longer pooled.
fn next_in_pool(pool: &[UserId], last: Option<UserId>) -> UserId {
    match last.and_then(|l| pool.iter().position(|u| *u == l)) {
        Some(idx) => pool[(idx + 1) % pool.len()],
        None => pool[0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use despacho_core::Slot;
    use despacho_store::{Store, assignment as rows, shifts};

    async fn shift_with_pool(conn: &mut SqliteConnection, users: &[UserId]) -> ShiftId {
        let date = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let id = shifts::insert(conn, date, Slot::Morning).await.unwrap();
        let now = Utc::now();
        shifts::activate(conn, id, now, now).await.unwrap();
        for u in users {
            rows::set_qualification(conn, id, *u, 1, true).await.unwrap();
        }
        id
    }

    #[test]
    fn next_in_pool_wraps_and_resets() {
        let pool = [10, 20, 30];
        assert_eq!(next_in_pool(&pool, None), 10);
        assert_eq!(next_in_pool(&pool, Some(10)), 20);
        assert_eq!(next_in_pool(&pool, Some(30)), 10);
        // A cursor pointing at a removed operator starts over.
        assert_eq!(next_in_pool(&pool, Some(99)), 10);
    }

    #[tokio::test]
    async fn empty_pool_returns_no_operator() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let s = shift_with_pool(&mut conn, &[]).await;

        let got = assign_operator(&mut conn, s, "Super Uno", 1).await.unwrap();
        assert_eq!(got.operator, None);
        assert_eq!(got.reason, AssignmentReason::NoPool);
    }

    #[tokio::test]
    async fn round_robin_then_affinity() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let s = shift_with_pool(&mut conn, &[10, 20]).await;

        // First client takes the first pool element and binds to it.
        let a = assign_operator(&mut conn, s, "Super Uno", 1).await.unwrap();
        assert_eq!(a.operator, Some(10));
        assert_eq!(a.reason, AssignmentReason::RoundRobin);

        // Same client again: sticky.
        let b = assign_operator(&mut conn, s, "super uno", 1).await.unwrap();
        assert_eq!(b.operator, Some(10));
        assert_eq!(b.reason, AssignmentReason::Affinity);

        // A new client rotates to the next operator.
        let c = assign_operator(&mut conn, s, "Super Dos", 1).await.unwrap();
        assert_eq!(c.operator, Some(20));
        assert_eq!(c.reason, AssignmentReason::RoundRobin);

        // And the next one wraps back around.
        let d = assign_operator(&mut conn, s, "Super Tres", 1).await.unwrap();
        assert_eq!(d.operator, Some(10));
        assert_eq!(rows::cursor_for(&mut conn, s, 1).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn pool_removal_rebinds_affinity() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let s = shift_with_pool(&mut conn, &[10, 20]).await;

        let first = assign_operator(&mut conn, s, "Super Uno", 1).await.unwrap();
        assert_eq!(first.operator, Some(10));

        // Disqualify the bound operator; the next request re-binds via
        // round-robin and sticks to the new pick.
        rows::set_qualification(&mut conn, s, 10, 1, false)
            .await
            .unwrap();
        let rebound = assign_operator(&mut conn, s, "Super Uno", 1).await.unwrap();
        assert_eq!(rebound.operator, Some(20));
        assert_eq!(rebound.reason, AssignmentReason::RoundRobin);

        let sticky = assign_operator(&mut conn, s, "Super Uno", 1).await.unwrap();
        assert_eq!(sticky.operator, Some(20));
        assert_eq!(sticky.reason, AssignmentReason::Affinity);
    }

    #[tokio::test]
    async fn codes_rotate_independently() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let s = shift_with_pool(&mut conn, &[10, 20]).await;
        rows::set_qualification(&mut conn, s, 30, 2, true).await.unwrap();

        let a = assign_operator(&mut conn, s, "Super Uno", 1).await.unwrap();
        let b = assign_operator(&mut conn, s, "Super Uno", 2).await.unwrap();
        assert_eq!(a.operator, Some(10));
        assert_eq!(b.operator, Some(30));
    }
}
