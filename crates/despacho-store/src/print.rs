// SPDX-License-Identifier: MIT OR Apache-2.0
//! Print jobs and their N:M link to lines.

use crate::orders::{SELECT_BASE, SelectedLine, map_selected};
use crate::{StoreResult, col_enum, col_ts, ts_to_sql};
use chrono::{DateTime, Utc};
use despacho_core::{LineId, LoteId, PrintJob, PrintJobId, PrintJobKind, PrintJobStatus, ShiftId, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

fn map_job(row: &SqliteRow) -> StoreResult<PrintJob> {
    Ok(PrintJob {
        id: row.try_get("id")?,
        shift_id: row.try_get("shift_id")?,
        route_norm: row.try_get("route_norm")?,
        actor_user: row.try_get("actor_user")?,
        kind: col_enum(row, "kind")?,
        status: col_enum(row, "status")?,
        pdf_ref: row.try_get("pdf_ref")?,
        cutoff_lote: row.try_get("cutoff_lote")?,
        from_lote: row.try_get("from_lote")?,
        to_lote: row.try_get("to_lote")?,
        error_text: row.try_get("error_text")?,
        created_at: col_ts(row, "created_at")?,
    })
}

/// A job row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewPrintJob {
    /// Shift the job belongs to.
    pub shift_id: ShiftId,
    /// Normalized route name.
    pub route_norm: String,
    /// Acting user, when attributed.
    pub actor_user: Option<UserId>,
    /// Job kind.
    pub kind: PrintJobKind,
    /// Job status.
    pub status: PrintJobStatus,
    /// Document blob reference.
    pub pdf_ref: String,
    /// Snapshot boundary, for initial jobs.
    pub cutoff_lote: Option<LoteId>,
    /// First covered lote.
    pub from_lote: Option<LoteId>,
    /// Last covered lote.
    pub to_lote: Option<LoteId>,
    /// Render failure detail.
    pub error_text: Option<String>,
}

/// Insert a job row.
pub async fn insert_job(
    conn: &mut SqliteConnection,
    job: &NewPrintJob,
    now: DateTime<Utc>,
) -> StoreResult<PrintJobId> {
    let res = sqlx::query(
        "INSERT INTO print_jobs
         (shift_id, route_norm, actor_user, kind, status, pdf_ref,
          cutoff_lote, from_lote, to_lote, error_text, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(job.shift_id)
    .bind(&job.route_norm)
    .bind(job.actor_user)
    .bind(job.kind.as_str())
    .bind(job.status.as_str())
    .bind(&job.pdf_ref)
    .bind(job.cutoff_lote)
    .bind(job.from_lote)
    .bind(job.to_lote)
    .bind(&job.error_text)
    .bind(ts_to_sql(now))
    .execute(conn)
    .await?;
    Ok(res.last_insert_rowid())
}

/// Link the printed lines to the job.
pub async fn insert_items(
    conn: &mut SqliteConnection,
    job_id: PrintJobId,
    line_ids: &[LineId],
) -> StoreResult<()> {
    for line_id in line_ids {
        sqlx::query("INSERT INTO print_job_items (print_job_id, line_id) VALUES (?, ?)")
            .bind(job_id)
            .bind(line_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Fetch one job.
pub async fn get_job(
    conn: &mut SqliteConnection,
    id: PrintJobId,
) -> StoreResult<Option<PrintJob>> {
    let row = sqlx::query("SELECT * FROM print_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(map_job).transpose()
}

/// The job's lines with their document context, in selector order. Used
/// to rebuild the item set for reprints.
pub async fn job_lines(
    conn: &mut SqliteConnection,
    job_id: PrintJobId,
) -> StoreResult<Vec<SelectedLine>> {
    let sql = format!(
        "{SELECT_BASE}
         JOIN print_job_items pji ON pji.line_id = n.id
         WHERE pji.print_job_id = ?
         ORDER BY l.created_at, l.id, c.id, n.seq_in_client"
    );
    let rows = sqlx::query(&sql).bind(job_id).fetch_all(conn).await?;
    rows.iter().map(map_selected).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Store, lotes, orders, routes, shifts};
    use chrono::NaiveDate;
    use despacho_core::{ParseStatus, Slot};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[tokio::test]
    async fn job_roundtrip_with_items() {
        let store = Store::connect_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let shift = shifts::insert(&mut conn, date, Slot::Morning).await.unwrap();
        let now = Utc::now();
        shifts::activate(&mut conn, shift, now, now).await.unwrap();
        let rd = routes::find_or_create(&mut conn, shift, "RUTA NORTE")
            .await
            .unwrap();
        let lote = lotes::insert_ingested(
            &mut conn,
            &lotes::NewLote {
                uidvalidity: 1,
                uid: 1,
                received_at: now,
                subject_raw: "Ruta Norte".into(),
                body_raw: String::new(),
                shift_id: shift,
                parse_status: ParseStatus::Ok,
                parse_error: None,
            },
        )
        .await
        .unwrap()
        .unwrap();
        lotes::set_route_day(&mut conn, lote, rd.id).await.unwrap();
        let client = orders::insert_client_order(&mut conn, lote, "Super Uno", "SUPER UNO", None)
            .await
            .unwrap();
        let line = orders::insert_line(
            &mut conn,
            &orders::NewLine {
                client_order_id: client,
                seq_in_client: 1,
                quantity: Decimal::from_str("1").unwrap(),
                unit_raw: "L".into(),
                product_raw: "Leche".into(),
                product_norm: "LECHE".into(),
                price: None,
                currency: "EUR".into(),
                match_method: None,
                match_score: None,
                family: 6,
                functional_code: 6,
                operator_user: None,
                assigned_at: None,
            },
        )
        .await
        .unwrap();

        let job_id = insert_job(
            &mut conn,
            &NewPrintJob {
                shift_id: shift,
                route_norm: "RUTA NORTE".into(),
                actor_user: Some(10),
                kind: PrintJobKind::OperatorInitial,
                status: PrintJobStatus::PdfReady,
                pdf_ref: "job.pdf".into(),
                cutoff_lote: Some(lote),
                from_lote: None,
                to_lote: Some(lote),
                error_text: None,
            },
            now,
        )
        .await
        .unwrap();
        insert_items(&mut conn, job_id, &[line]).await.unwrap();

        let job = get_job(&mut conn, job_id).await.unwrap().unwrap();
        assert_eq!(job.kind, PrintJobKind::OperatorInitial);
        assert_eq!(job.status, PrintJobStatus::PdfReady);
        assert_eq!(job.to_lote, Some(lote));

        let items = job_lines(&mut conn, job_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].line.id, line);
        assert_eq!(items[0].client_name, "Super Uno");
    }
}
