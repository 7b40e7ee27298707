//! Deterministic test doubles for the tally agent.
//!
//! [`FakeCloud`] is an in-process stand-in for the cloud service: a real
//! HTTP listener on an ephemeral port, a scripted response queue, and
//! captured requests so scenarios can assert on exactly what went over the
//! wire. With an empty script it behaves like the real service's happy
//! path: it deduplicates by idempotency key and reports
//! `{saved, duplicates}` accordingly, which is what the sync-twice law
//! tests lean on.

use std::collections::{HashSet, VecDeque};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};

use tally_schemas::wire::{BatchAccepted, BatchRequest};

// ---------------------------------------------------------------------------
// FakeCloud
// ---------------------------------------------------------------------------

/// One scripted reply for the batch endpoint. Scripted replies are consumed
/// in order; when the queue is empty the fake falls back to dedupe-aware
/// success.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    /// 200 with `saved` = number of not-yet-seen events.
    Ok,
    /// Arbitrary status with an `{"error": "scripted"}` body.
    Status(u16),
    /// 200 with a body that does not parse.
    MalformedBody,
}

#[derive(Default)]
struct FakeCloudState {
    batches: Mutex<Vec<BatchRequest>>,
    bearer_seen: Mutex<Vec<Option<String>>>,
    script: Mutex<VecDeque<ScriptedResponse>>,
    saved_keys: Mutex<HashSet<String>>,
    healthy: AtomicBool,
    probe_count: AtomicUsize,
    upload_count: AtomicUsize,
}

/// Handle to a running fake cloud service.
pub struct FakeCloud {
    pub addr: SocketAddr,
    state: Arc<FakeCloudState>,
}

impl FakeCloud {
    /// Bind an ephemeral port and start serving. Healthy by default.
    pub async fn spawn() -> Self {
        let state = Arc::new(FakeCloudState {
            healthy: AtomicBool::new(true),
            ..Default::default()
        });

        let router = Router::new()
            .route("/", get(health))
            .route("/v1/scans/batch", post(batch))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake cloud");
        let addr = listener.local_addr().expect("fake cloud addr");
        tokio::spawn(axum::serve(listener, router).into_future());

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Flip the health endpoint between 200 and 503.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Queue a scripted reply for the next batch upload.
    pub fn push_response(&self, response: ScriptedResponse) {
        self.state.script.lock().unwrap().push_back(response);
    }

    /// Every batch body received, in arrival order.
    pub fn batches(&self) -> Vec<BatchRequest> {
        self.state.batches.lock().unwrap().clone()
    }

    /// The `Authorization` header of each upload, in arrival order.
    pub fn bearer_seen(&self) -> Vec<Option<String>> {
        self.state.bearer_seen.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.state.probe_count.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.state.upload_count.load(Ordering::SeqCst)
    }

    /// Number of unique idempotency keys accepted so far.
    pub fn unique_saved(&self) -> usize {
        self.state.saved_keys.lock().unwrap().len()
    }
}

async fn health(State(state): State<Arc<FakeCloudState>>) -> StatusCode {
    state.probe_count.fetch_add(1, Ordering::SeqCst);
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn batch(
    State(state): State<Arc<FakeCloudState>>,
    headers: HeaderMap,
    Json(body): Json<BatchRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.upload_count.fetch_add(1, Ordering::SeqCst);
    state.bearer_seen.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    state.batches.lock().unwrap().push(body.clone());

    let scripted = state.script.lock().unwrap().pop_front();
    match scripted {
        Some(ScriptedResponse::Status(code)) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(serde_json::json!({"error": "scripted"})),
        ),
        Some(ScriptedResponse::MalformedBody) => {
            (StatusCode::OK, Json(serde_json::json!("not a batch ack")))
        }
        Some(ScriptedResponse::Ok) | None => {
            let mut saved_keys = state.saved_keys.lock().unwrap();
            let mut saved = 0i64;
            let mut duplicates = 0i64;
            for event in &body.events {
                if saved_keys.insert(event.idempotency_key.clone()) {
                    saved += 1;
                } else {
                    duplicates += 1;
                }
            }
            (
                StatusCode::OK,
                Json(serde_json::to_value(BatchAccepted { saved, duplicates }).unwrap()),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Store + config fixtures
// ---------------------------------------------------------------------------

/// A migrated store on a temp file. Keep the handle alive for the test's
/// duration; dropping it removes the directory.
pub struct TempStore {
    pub dir: tempfile::TempDir,
    pub store: tally_db::Store,
}

pub async fn temp_store() -> TempStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = tally_db::Store::open(&dir.path().join("tally.db"))
        .await
        .expect("open temp store");
    TempStore { dir, store }
}

/// An [`tally_config::AgentConfig`] pointed at `cloud_url` with timings
/// tightened for tests. No filesystem or environment access.
pub fn test_config(cloud_url: &str) -> tally_config::AgentConfig {
    use std::time::Duration;
    use tally_config::*;

    AgentConfig {
        cloud: CloudConfig {
            url: cloud_url.trim_end_matches('/').to_string(),
            batch_size: 100,
            upload_timeout: Duration::from_secs(5),
        },
        station_name: "Gate-1".to_string(),
        health: HealthConfig {
            interval: Some(Duration::from_secs(60)),
            timeout: Duration::from_secs(1),
            initial_delay: Duration::ZERO,
            hysteresis_threshold: 2,
        },
        auto_sync: AutoSyncConfig {
            enabled: true,
            idle: Duration::from_secs(30),
            check_interval: Duration::from_secs(60),
            min_pending: 1,
            connection_timeout: Duration::from_secs(2),
        },
        retry: RetryConfig {
            enabled: true,
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            max_consecutive_failures: 5,
            failure_cooldown: Duration::from_secs(300),
        },
        duplicate: DuplicateConfig {
            enabled: true,
            window: Duration::from_secs(60),
            action: DuplicateAction::Warn,
        },
        db_path: std::path::PathBuf::from(":memory:"),
        server_addr: "127.0.0.1:0".parse().expect("test addr"),
        secrets: ResolvedSecrets {
            cloud_key: Secret::new("test-key".to_string()),
            admin_pin: Some(Secret::new("0000".to_string())),
        },
        config_hash: "test".to_string(),
    }
}
