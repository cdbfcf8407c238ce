// SPDX-License-Identifier: MIT OR Apache-2.0
//! Print-engine flows: enter/initial/new, collector sheets, reprints, the
//! FAILED-job path, and the visual transitions they drive.

mod common;

use common::{BrokenRenderer, Deployment};
use despacho_core::{LogicalState, PrintJobKind, PrintJobStatus, VisualState};
use despacho_engine::{EngineError, route_state};
use despacho_store::{print as jobs, progress, routes};
use std::sync::Arc;

async fn visual_of(deploy: &Deployment, shift: i64, route: &str) -> (i64, VisualState, LogicalState) {
    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let rd = routes::find(&mut conn, shift, route).await.unwrap().unwrap();
    (rd.id, rd.visual_state, rd.logical_state)
}

#[tokio::test]
async fn enter_print_initial_goes_green_then_new_lote_alerts_red() {
    let deploy = Deployment::new().await;
    let shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;

    let outcome = deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    assert!(outcome.entered);
    let cutoff = outcome.cutoff_lote.expect("cutoff at the only lote");

    // Re-entering is a no-op: same cutoff.
    let again = deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    assert!(!again.entered);
    assert_eq!(again.cutoff_lote, Some(cutoff));

    let receipt = deploy
        .printer
        .print_operator_initial(10, "RUTA NORTE")
        .await
        .unwrap();
    assert_eq!(receipt.lines_count, 1);

    let (_, visual, _) = visual_of(&deploy, shift.id, "RUTA NORTE").await;
    assert_eq!(visual, VisualState::Green);
    assert_eq!(deploy.events_of_type("ROUTE_COMPLETE_GREEN").await.len(), 1);
    assert_eq!(deploy.events_of_type("PRINT_EMITTED").await.len(), 1);

    // A new lote on the complete route raises the alert.
    deploy
        .deliver_email(2, "Ruta Norte", "Cliente: Super Uno\n2 L - Leche - 1.20")
        .await;
    let (_, visual, logical) = visual_of(&deploy, shift.id, "RUTA NORTE").await;
    assert_eq!(visual, VisualState::Red);
    assert_eq!(logical, LogicalState::Active);
    assert_eq!(deploy.events_of_type("ROUTE_ALERT_RED").await.len(), 1);
}

#[tokio::test]
async fn print_new_covers_only_lotes_after_the_cursor() {
    let deploy = Deployment::new().await;
    let _shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;

    deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    deploy
        .printer
        .print_operator_initial(10, "RUTA NORTE")
        .await
        .unwrap();

    // Nothing new yet.
    match deploy.printer.print_operator_new(10, "RUTA NORTE").await {
        Err(EngineError::NothingToPrint) => {}
        other => panic!("expected NOTHING_TO_PRINT, got {other:?}"),
    }

    deploy
        .deliver_email(2, "Ruta Norte", "Cliente: Super Uno\n2 L - Leche - 1.20")
        .await;
    let receipt = deploy
        .printer
        .print_operator_new(10, "RUTA NORTE")
        .await
        .unwrap();
    assert_eq!(receipt.lines_count, 1);

    let job = {
        let mut conn = deploy.store.pool().acquire().await.unwrap();
        jobs::get_job(&mut conn, receipt.job_id).await.unwrap().unwrap()
    };
    assert_eq!(job.kind, PrintJobKind::OperatorNew);
    assert_eq!(job.status, PrintJobStatus::PdfReady);
}

#[tokio::test]
async fn print_guards_no_enter_and_no_initial() {
    let deploy = Deployment::new().await;
    let _shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;

    match deploy.printer.print_operator_initial(10, "RUTA NORTE").await {
        Err(EngineError::NoEnter) => {}
        other => panic!("expected NO_ENTER, got {other:?}"),
    }

    deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    match deploy.printer.print_operator_new(10, "RUTA NORTE").await {
        Err(EngineError::NoInitial) => {}
        other => panic!("expected NO_INITIAL, got {other:?}"),
    }

    match deploy.printer.enter_route(10, "RUTA SUR").await {
        Err(EngineError::RouteNotFound { .. }) => {}
        other => panic!("expected ROUTE_NOT_FOUND, got {other:?}"),
    }
}

#[tokio::test]
async fn collector_print_covers_everyone_and_advances_its_own_cursor() {
    let deploy = Deployment::new().await;
    let shift = deploy.seed_and_open(&[10, 20]).await;
    deploy
        .deliver_email(
            1,
            "Ruta Norte",
            "Cliente: Super Uno\n1 L - Leche - 1.20\nCliente: Super Dos\n2 L - Leche - 1.20",
        )
        .await;

    let receipt = deploy
        .printer
        .print_collector_new(Some(7), "RUTA NORTE")
        .await
        .unwrap();
    assert_eq!(receipt.lines_count, 2);

    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let cursor = progress::collector_progress(&mut conn, shift.id, "RUTA NORTE")
        .await
        .unwrap()
        .unwrap();
    assert!(cursor.last_closed_lote.is_some());
    drop(conn);

    // Collector printing stamps lines, so the route is complete.
    let (_, visual, _) = visual_of(&deploy, shift.id, "RUTA NORTE").await;
    assert_eq!(visual, VisualState::Green);

    match deploy.printer.print_collector_new(Some(7), "RUTA NORTE").await {
        Err(EngineError::NothingToPrint) => {}
        other => panic!("expected NOTHING_TO_PRINT, got {other:?}"),
    }
}

#[tokio::test]
async fn collector_binding_is_enforced() {
    let deploy = Deployment::new().await;
    let shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;
    {
        let mut conn = deploy.store.pool().acquire().await.unwrap();
        routes::set_collector(&mut conn, shift.id, "RUTA NORTE", 7).await.unwrap();
    }

    match deploy.printer.print_collector_new(Some(8), "RUTA NORTE").await {
        Err(EngineError::Forbidden) => {}
        other => panic!("expected FORBIDDEN, got {other:?}"),
    }
    deploy
        .printer
        .print_collector_new(Some(7), "RUTA NORTE")
        .await
        .unwrap();
}

#[tokio::test]
async fn reprint_increments_counts_without_moving_cursors() {
    let deploy = Deployment::new().await;
    let shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;
    deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    let initial = deploy
        .printer
        .print_operator_initial(10, "RUTA NORTE")
        .await
        .unwrap();

    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let before = progress::operator_progress(&mut conn, shift.id, 10, "RUTA NORTE")
        .await
        .unwrap()
        .unwrap();
    drop(conn);

    let reprint = deploy.printer.reprint(initial.job_id, Some(10)).await.unwrap();
    assert_eq!(reprint.lines_count, 1);
    assert_ne!(reprint.job_id, initial.job_id);

    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let job = jobs::get_job(&mut conn, reprint.job_id).await.unwrap().unwrap();
    assert_eq!(job.kind, PrintJobKind::Reprint);

    let lines = jobs::job_lines(&mut conn, reprint.job_id).await.unwrap();
    assert_eq!(lines[0].line.print_count, 2);
    assert!(lines[0].line.printed_at.is_some());

    let after = progress::operator_progress(&mut conn, shift.id, 10, "RUTA NORTE")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.last_printed_lote, before.last_printed_lote);
    assert_eq!(after.last_printed_at, before.last_printed_at);
}

#[tokio::test]
async fn render_failure_records_failed_job_and_stamps_nothing() {
    let deploy = Deployment::with_renderer(Arc::new(BrokenRenderer)).await;
    let shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;
    deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();

    match deploy.printer.print_operator_initial(10, "RUTA NORTE").await {
        Err(EngineError::Render(_)) => {}
        other => panic!("expected render failure, got {other:?}"),
    }

    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let failed: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM print_jobs WHERE status = 'FAILED'")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
    assert_eq!(failed.len(), 1);

    let rd = routes::find(&mut conn, shift.id, "RUTA NORTE").await.unwrap().unwrap();
    assert_eq!(routes::unprinted_count(&mut conn, rd.id).await.unwrap(), 1);
    let prog = progress::operator_progress(&mut conn, shift.id, 10, "RUTA NORTE")
        .await
        .unwrap()
        .unwrap();
    assert!(prog.last_printed_lote.is_none());
    drop(conn);
    assert!(deploy.events_of_type("PRINT_EMITTED").await.is_empty());
}

#[tokio::test]
async fn collect_then_new_lote_alerts_and_counts_reactivation() {
    let deploy = Deployment::new().await;
    let shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;
    deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    deploy
        .printer
        .print_operator_initial(10, "RUTA NORTE")
        .await
        .unwrap();

    let (rd_id, visual, _) = visual_of(&deploy, shift.id, "RUTA NORTE").await;
    assert_eq!(visual, VisualState::Green);

    // Collecting with pending work is refused.
    route_state::mark_collected(&deploy.store, &deploy.bus, rd_id, Some(7))
        .await
        .unwrap();
    assert_eq!(deploy.events_of_type("ROUTE_COLLECTED").await.len(), 1);

    deploy
        .deliver_email(2, "Ruta Norte", "Cliente: Super Uno\n2 L - Leche - 1.20")
        .await;

    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let rd = routes::get(&mut conn, rd_id).await.unwrap().unwrap();
    assert_eq!(rd.visual_state, VisualState::Red);
    // Logical state does not revert on its own.
    assert_eq!(rd.logical_state, LogicalState::Collected);
    assert_eq!(rd.reactivations_count, 1);
    drop(conn);

    // Re-entering the route reactivates it.
    deploy.printer.enter_route(10, "RUTA NORTE").await.unwrap();
    let mut conn = deploy.store.pool().acquire().await.unwrap();
    let rd = routes::get(&mut conn, rd_id).await.unwrap().unwrap();
    assert_eq!(rd.logical_state, LogicalState::Active);
}

#[tokio::test]
async fn collect_with_pending_work_is_blocked() {
    let deploy = Deployment::new().await;
    let shift = deploy.seed_and_open(&[10]).await;
    deploy
        .deliver_email(1, "Ruta Norte", "Cliente: Super Uno\n1 L - Leche - 1.20")
        .await;
    let (rd_id, _, _) = visual_of(&deploy, shift.id, "RUTA NORTE").await;

    match route_state::mark_collected(&deploy.store, &deploy.bus, rd_id, Some(7)).await {
        Err(EngineError::ValidationBlocked { .. }) => {}
        other => panic!("expected VALIDATION_BLOCKED, got {other:?}"),
    }
}
