//! Axum router and all HTTP handlers for tally-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)`-free on purpose:
//! scenario tests compose the router directly against a temp store.
//!
//! Storage faults abort the process (log, then exit): a scanning station
//! must never keep accepting badges it cannot durably record.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

use tally_health::ConnState;
use tally_schemas::{validate_station_name, Signal};
use tally_sync::EngineState;

use crate::api_types::{
    AdminRefusedResponse, HealthResponse, OkResponse, ResetFailedResponse, ResetStationRequest,
    RosterReplaceRequest, RosterReplaceResponse, SnapshotResponse, SubmitScanRequest,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
/// Middleware layers are attached in `main.rs` so tests get the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/snapshot", get(snapshot))
        .route("/v1/scans", post(submit_scan))
        .route("/v1/sync/counts", get(sync_counts))
        .route("/v1/sync/now", post(sync_now))
        .route("/v1/connectivity/test", post(connectivity_test))
        .route("/v1/admin/reset-failed", post(reset_failed))
        .route("/v1/admin/reset-station", post(reset_station))
        .route("/v1/roster", post(replace_roster))
        .route("/v1/stream", get(stream))
        .with_state(state)
}

/// Storage faults are fatal at the process level: log and abort rather
/// than silently dropping scans.
fn storage_fatal(e: anyhow::Error) -> ! {
    error!(error = %format!("{e:#}"), "storage fault; aborting to avoid silent data loss");
    std::process::exit(70);
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/snapshot
// ---------------------------------------------------------------------------

async fn snapshot(State(st): State<Arc<AppState>>) -> Response {
    let counts = match st.store.count_by_status().await {
        Ok(c) => c,
        Err(e) => storage_fatal(e),
    };
    let day_start = chrono::Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(chrono::Utc::now);
    let today_count = match st.store.count_since(day_start).await {
        Ok(n) => n,
        Err(e) => storage_fatal(e),
    };
    let roster_count = match st.store.roster_count().await {
        Ok(n) => n,
        Err(e) => storage_fatal(e),
    };
    let recent = match st.store.recent_scans(10).await {
        Ok(scans) => scans.iter().map(tally_intake::RecentScan::from).collect(),
        Err(e) => storage_fatal(e),
    };

    let connectivity = match st.oracle.state() {
        ConnState::Unknown => "unknown",
        ConnState::Online => "online",
        ConnState::Offline => "offline",
    };
    let sync_state = match st.engine.state() {
        EngineState::Idle => "idle",
        EngineState::Probing => "probing",
        EngineState::Uploading => "uploading",
        EngineState::Cooldown => "cooldown",
    };

    (
        StatusCode::OK,
        Json(SnapshotResponse {
            station: st.station_name.clone(),
            counts,
            today_count,
            roster_count,
            recent,
            connectivity: connectivity.to_string(),
            sync_state: sync_state.to_string(),
            config: st.config_echo.clone(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/roster
// ---------------------------------------------------------------------------

/// Wholesale roster replacement, the importer collaborator's notification
/// path. The core stores the snapshot and refreshes the roster hash; it
/// does not orchestrate the import itself.
async fn replace_roster(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RosterReplaceRequest>,
) -> Response {
    let entries: Vec<(String, serde_json::Value)> = body
        .entries
        .into_iter()
        .map(|e| (e.badge_id, e.payload))
        .collect();

    match st.store.replace_roster(&entries).await {
        Ok(roster_hash) => {
            info!(count = entries.len(), "roster replaced");
            (
                StatusCode::OK,
                Json(RosterReplaceResponse {
                    count: entries.len(),
                    roster_hash,
                }),
            )
                .into_response()
        }
        Err(e) => storage_fatal(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/scans
// ---------------------------------------------------------------------------

async fn submit_scan(
    State(st): State<Arc<AppState>>,
    Json(body): Json<SubmitScanRequest>,
) -> Response {
    match st.intake.submit_scan(&body.raw).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => storage_fatal(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/sync/counts + POST /v1/sync/now
// ---------------------------------------------------------------------------

async fn sync_counts(State(st): State<Arc<AppState>>) -> Response {
    match st.store.count_by_status().await {
        Ok(counts) => (StatusCode::OK, Json(counts)).into_response(),
        Err(e) => storage_fatal(e),
    }
}

async fn sync_now(State(st): State<Arc<AppState>>) -> Response {
    match st.engine.sync_now().await {
        Ok(summary) => {
            info!(
                synced = summary.synced,
                failed = summary.failed,
                skipped = summary.skipped,
                "manual sync",
            );
            (StatusCode::OK, Json(summary)).into_response()
        }
        Err(e) => storage_fatal(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/connectivity/test
// ---------------------------------------------------------------------------

/// Non-blocking: kicks a probe; the outcome arrives on the signal stream.
async fn connectivity_test(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    st.oracle.request_probe();
    (StatusCode::ACCEPTED, Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// POST /v1/admin/*
// ---------------------------------------------------------------------------

async fn reset_failed(State(st): State<Arc<AppState>>) -> Response {
    match st.store.reset_failed_to_pending().await {
        Ok(reset) => {
            info!(reset, "failed scans reset to pending");
            (StatusCode::OK, Json(ResetFailedResponse { reset })).into_response()
        }
        Err(e) => storage_fatal(e),
    }
}

/// Station identity is per process lifetime: this purges the ledger and
/// rewrites the persisted identity; the daemon keeps its in-memory identity
/// until restart.
async fn reset_station(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ResetStationRequest>,
) -> Response {
    // Gate: the reset purges the ledger; it requires the configured PIN.
    let refused = |error: String| {
        (
            StatusCode::FORBIDDEN,
            Json(AdminRefusedResponse {
                error,
                gate: "admin_pin".to_string(),
            }),
        )
            .into_response()
    };

    let Some(expected) = st.admin_pin.as_ref() else {
        return refused("ADMIN_REFUSED: no admin PIN configured; station reset disabled".to_string());
    };
    if body.pin != expected.expose() {
        return refused("ADMIN_REFUSED: incorrect PIN".to_string());
    }

    if let Err(reason) = validate_station_name(&body.new_station) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(AdminRefusedResponse {
                error: format!("ADMIN_REFUSED: {reason}"),
                gate: "station_name".to_string(),
            }),
        )
            .into_response();
    }

    match st
        .store
        .reset_station(&body.new_station, chrono::Utc::now())
        .await
    {
        Ok(()) => {
            info!(station = %body.new_station, "station reset; prior scans purged");
            (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
        }
        Err(e) => storage_fatal(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);
    Sse::new(events).keep_alive(KeepAlive::new()).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<Signal>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    Signal::ConnectionStatusChanged { .. } => "connection_status_changed",
                    Signal::SyncStageChanged { .. } => "sync_stage_changed",
                    Signal::DuplicateDetected { .. } => "duplicate_detected",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
