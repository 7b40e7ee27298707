//! Request/response bodies for the daemon control plane.

use serde::{Deserialize, Serialize};

use tally_config::ConfigEcho;
use tally_intake::RecentScan;
use tally_schemas::StatusCounts;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Initial snapshot for a display surface attaching to the daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub station: String,
    pub counts: StatusCounts,
    pub today_count: i64,
    pub roster_count: i64,
    pub recent: Vec<RecentScan>,
    /// "unknown" | "online" | "offline"
    pub connectivity: String,
    /// "idle" | "probing" | "uploading" | "cooldown"
    pub sync_state: String,
    pub config: ConfigEcho,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitScanRequest {
    pub raw: String,
}

/// One roster row as delivered by the importer collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RosterEntry {
    pub badge_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Wholesale roster replacement (the importer's notification path).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RosterReplaceRequest {
    pub entries: Vec<RosterEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RosterReplaceResponse {
    pub count: usize,
    pub roster_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResetFailedResponse {
    pub reset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResetStationRequest {
    pub pin: String,
    pub new_station: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Refusal payload for gated administrative operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminRefusedResponse {
    pub error: String,
    pub gate: String,
}
