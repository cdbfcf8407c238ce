// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use despacho_bus::EventBus;
use despacho_config::AppConfig;
use despacho_engine::{BatchProcessor, PrintManager, ShiftManager, TextRenderer, shift};
use despacho_ingest::{ImapConnector, IngestWorker};
use despacho_server::{AppState, build_app};
use despacho_store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "despacho-server", version, about = "Order-dispatch backplane server")]
struct Args {
    /// Bind address override (defaults to HTTP_ADDR).
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("despacho=debug,sqlx=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("despacho=info,sqlx=warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) = AppConfig::from_env().context("load configuration")?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    let store = Store::connect(&config.database_url)
        .await
        .context("open database")?;
    let bus = EventBus::new();

    let processor = BatchProcessor::new(store.clone(), bus.clone(), config.fuzzy_threshold);
    let printer = PrintManager::new(
        store.clone(),
        bus.clone(),
        Arc::new(TextRenderer),
        config.pdf_dir.clone(),
    );

    let cancel = CancellationToken::new();
    let connector = Arc::new(ImapConnector::new(config.imap.clone()));
    let (worker, ingest_handle) = IngestWorker::new(
        connector,
        store.clone(),
        bus.clone(),
        processor.clone(),
        config.imap.folder.clone(),
        config.imap.poll_interval,
        cancel.clone(),
    );
    let ingest_task = tokio::spawn(worker.run());

    let shifts = ShiftManager::new(store.clone(), bus.clone())
        .with_poll_nudge(ingest_handle.nudge_sender());
    let closer_task = tokio::spawn(shift::auto_close_loop(shifts.clone(), cancel.clone()));

    let state = Arc::new(AppState {
        store,
        bus,
        shifts,
        printer,
        processor,
        ingest: ingest_handle,
    });
    let app = build_app(state);

    let bind = args.bind.unwrap_or_else(|| config.http_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, folder = %config.imap.folder, "despacho-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    // Drain: stop the ingest loop and the auto-closer, bounded by the
    // configured deadline.
    info!("shutting down; draining background tasks");
    cancel.cancel();
    let drain = async {
        let _ = ingest_task.await;
        let _ = closer_task.await;
    };
    if tokio::time::timeout(config.drain_deadline, drain).await.is_err() {
        warn!("drain deadline elapsed with tasks still running");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
