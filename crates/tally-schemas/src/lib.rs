//! Shared typed records for the tally agent.
//!
//! Everything that crosses a crate boundary lives here: the scan record and
//! its lifecycle status, the signal payloads broadcast to collaborators, the
//! wire bodies for the cloud batch endpoint, and the canonical timestamp
//! serializer. Keeping these in one dependency-light crate means the store,
//! the sync engine, and the daemon can never drift apart on a field name or
//! a timestamp format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod time;
pub mod wire;

// ---------------------------------------------------------------------------
// SyncStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a recorded scan.
///
/// `Pending` is the only initial state. `Pending → Synced` and
/// `Pending → Failed` are the only transitions; `Synced` is terminal and
/// `Failed` can return to `Pending` only via the administrative reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    /// Canonical storage string. Matches the CHECK constraint in the schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// A single badge event as persisted in the local store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scan {
    /// Store-assigned rowid; strictly increasing per station.
    pub local_id: i64,
    pub badge_id: String,
    pub station_name: String,
    pub scanned_at_utc: DateTime<Utc>,
    /// Whether the badge was present in the local roster at insert time.
    pub matched: bool,
    pub sync_status: SyncStatus,
    /// `"{station_name}-{badge_id}-{local_id}"`; the cloud service
    /// deduplicates by this key.
    pub idempotency_key: String,
    pub last_error: Option<String>,
    pub attempt_count: i64,
}

/// Deterministic idempotency key for a scan.
///
/// Stable: recomputing at any later time yields the same key, so a retried
/// upload of the same logical event is safe for the remote deduplicator.
pub fn idempotency_key(station_name: &str, badge_id: &str, local_id: i64) -> String {
    format!("{station_name}-{badge_id}-{local_id}")
}

// ---------------------------------------------------------------------------
// StatusCounts
// ---------------------------------------------------------------------------

/// Per-status scan totals, as returned by the store and the counts API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}

impl StatusCounts {
    /// Conservation: `pending + synced + failed` equals total inserted.
    pub fn total(&self) -> i64 {
        self.pending + self.synced + self.failed
    }
}

// ---------------------------------------------------------------------------
// Station name validation
// ---------------------------------------------------------------------------

/// Station names are 1–50 chars from `[A-Za-z0-9 _-]`.
///
/// Returns the offending reason on rejection; shared by config load and the
/// administrative reset path so both enforce the same alphabet.
pub fn validate_station_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("station name must not be empty".to_string());
    }
    let chars = name.chars().count();
    if chars > 50 {
        return Err(format!("station name exceeds 50 chars ({chars})"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-')))
    {
        return Err(format!("station name contains forbidden character {bad:?}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal (broadcast bus payload)
// ---------------------------------------------------------------------------

/// Shutdown / cycle stage labels carried by [`Signal::SyncStageChanged`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Sync,
    Export,
    Complete,
}

/// Messages broadcast to collaborators (display surface, admin tooling).
///
/// Delivery order on the bus is the total order of emission; consumers that
/// lag are dropped by the broadcast channel, never blocking the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    ConnectionStatusChanged {
        ok: bool,
        message: String,
    },
    SyncStageChanged {
        stage: SyncStage,
        ok: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    DuplicateDetected {
        badge_id: String,
        station_name: String,
        scanned_at: String,
    },
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_string() {
        for s in [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SyncStatus::parse("uploading"), None);
    }

    #[test]
    fn idempotency_key_is_stable_and_positional() {
        assert_eq!(idempotency_key("Gate-1", "A", 1), "Gate-1-A-1");
        assert_eq!(
            idempotency_key("Gate-1", "A", 1),
            idempotency_key("Gate-1", "A", 1),
        );
        assert_ne!(
            idempotency_key("Gate-1", "A", 1),
            idempotency_key("Gate-1", "A", 2),
        );
    }

    #[test]
    fn station_name_alphabet_enforced() {
        assert!(validate_station_name("Gate-1").is_ok());
        assert!(validate_station_name("Main Hall_2").is_ok());
        assert!(validate_station_name("").is_err());
        assert!(validate_station_name("Gate/1").is_err());
        assert!(validate_station_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn signal_serializes_with_type_tag() {
        let sig = Signal::ConnectionStatusChanged {
            ok: true,
            message: "online".to_string(),
        };
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.contains("\"type\":\"connection_status_changed\""));
    }
}
