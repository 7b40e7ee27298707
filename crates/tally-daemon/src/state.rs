//! Shared runtime state for tally-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Everything here is
//! assembled once at startup from the immutable configuration record; the
//! broadcast bus is the one ordered delivery path for collaborator signals.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tally_cloud::CloudClient;
use tally_config::{AgentConfig, ConfigEcho, Secret};
use tally_db::Store;
use tally_health::ConnectivityOracle;
use tally_intake::ScanIntake;
use tally_schemas::Signal;
use tally_sync::{ActivityTracker, SyncEngine};

/// Static build metadata included in health responses.
#[derive(Clone, Copy, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub store: Store,
    pub intake: ScanIntake,
    pub engine: Arc<SyncEngine>,
    pub oracle: Arc<ConnectivityOracle>,
    pub activity: Arc<ActivityTracker>,
    pub bus: broadcast::Sender<Signal>,
    pub station_name: String,
    pub config_echo: ConfigEcho,
    pub admin_pin: Option<Secret>,
    pub build: BuildInfo,
}

impl AppState {
    /// Wire every component from the loaded configuration. Establishes the
    /// station identity on first launch.
    pub async fn assemble(
        cfg: AgentConfig,
        store: Store,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let (bus, _rx) = broadcast::channel::<Signal>(1024);

        let station_name = store.ensure_station(&cfg.station_name, Utc::now()).await?;

        let client = CloudClient::new(&cfg.cloud.url, cfg.secrets.cloud_key.clone());
        let oracle = ConnectivityOracle::new(client.clone(), cfg.health.clone(), bus.clone());
        let activity = ActivityTracker::new(Utc::now());
        let engine = SyncEngine::new(store.clone(), client, cfg.clone(), cancel);
        let intake = ScanIntake::new(
            store.clone(),
            station_name.clone(),
            cfg.duplicate.clone(),
            Arc::clone(&activity),
            bus.clone(),
        );

        Ok(Arc::new(Self {
            store,
            intake,
            engine,
            oracle,
            activity,
            bus,
            station_name,
            config_echo: cfg.echo(),
            admin_pin: cfg.secrets.admin_pin.clone(),
            build: BuildInfo {
                service: "tally-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }))
    }
}
