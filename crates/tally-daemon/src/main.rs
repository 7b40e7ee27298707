//! tallyd entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads the layered
//! configuration (config faults are fatal), opens the store (storage
//! faults are fatal), wires the shared state, spawns the background loops,
//! and serves HTTP until a termination signal. On termination the
//! scheduler is quiesced first, then the shutdown orchestrator drains the
//! engine and hands off to the export collaborator before exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use tally_daemon::{routes, state};
use tally_sync::{AutoSyncScheduler, NoopExport, ShutdownOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let layer_paths = tally_config::default_layer_paths();
    let layer_refs: Vec<&Path> = layer_paths.iter().map(PathBuf::as_path).collect();
    let cfg = tally_config::load(&layer_refs).context("configuration load failed")?;

    let store = tally_db::Store::open(&cfg.db_path)
        .await
        .context("store open failed")?;

    let cancel = CancellationToken::new();
    let shared = state::AppState::assemble(cfg.clone(), store.clone(), cancel.clone()).await?;

    // Background loops: connectivity probing and the auto-sync scheduler.
    let oracle_task = tokio::spawn(Arc::clone(&shared.oracle).run(cancel.child_token()));

    let scheduler_token = CancellationToken::new();
    let scheduler = AutoSyncScheduler::new(
        cfg.auto_sync.clone(),
        Arc::clone(&shared.engine),
        store.clone(),
        Arc::clone(&shared.activity),
    );
    let scheduler_task = {
        let token = scheduler_token.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(token).await {
                error!(error = %format!("{e:#}"), "scheduler storage fault; aborting");
                std::process::exit(70);
            }
        })
    };

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let listener = tokio::net::TcpListener::bind(cfg.server_addr)
        .await
        .with_context(|| format!("bind {}", cfg.server_addr))?;
    info!(station = %shared.station_name, "tallyd listening on http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(termination_signal())
        .await
        .context("server crashed")?;

    // Quiesce the scheduler before draining: cancel, then await, so no
    // tick can land mid-drain.
    scheduler_token.cancel();
    let _ = scheduler_task.await;

    ShutdownOrchestrator::new(
        Arc::clone(&shared.engine),
        Arc::new(NoopExport),
        shared.bus.clone(),
    )
    .run()
    .await;

    cancel.cancel();
    let _ = oracle_task.await;
    info!("tallyd exited cleanly");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Resolves on SIGINT (ctrl-c) or, on unix, SIGTERM.
async fn termination_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received; shutting down"),
        _ = terminate => info!("SIGTERM received; shutting down"),
    }
}

/// CORS: allow only localhost origins; the display surface runs beside
/// the daemon, never across the network.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
