//! Agent configuration.
//!
//! Precedence: executable-directory `tally.yaml`, then working-directory
//! `tally.yaml` deep-merged over it, then process environment overrides.
//! The merged document is deserialized into typed sections, every numeric
//! option is clamped to its documented range (with a warning when a value
//! had to move), and secrets are resolved from the environment once.
//!
//! The result is an immutable [`AgentConfig`] passed into each component's
//! constructor. Components never read the environment or the filesystem for
//! configuration themselves.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub mod layering;
pub mod secrets;

pub use secrets::{resolve_secrets, ResolvedSecrets, Secret};

use layering::{finalize, load_layered_yaml, LoadedLayers};
use tally_schemas::validate_station_name;

// ---------------------------------------------------------------------------
// Raw (file-shaped) sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    cloud: RawCloud,
    #[serde(default)]
    station: RawStation,
    #[serde(default)]
    health: RawHealth,
    #[serde(default)]
    auto_sync: RawAutoSync,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    duplicate: RawDuplicate,
    #[serde(default)]
    db: RawDb,
    #[serde(default)]
    server: RawServer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawCloud {
    url: Option<String>,
    batch_size: i64,
    upload_timeout_secs: f64,
}

impl Default for RawCloud {
    fn default() -> Self {
        Self {
            url: None,
            batch_size: 100,
            upload_timeout_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawStation {
    name: String,
}

impl Default for RawStation {
    fn default() -> Self {
        Self {
            name: "Station-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawHealth {
    interval_secs: i64,
    timeout_secs: f64,
    initial_delay_secs: i64,
    hysteresis_threshold: i64,
}

impl Default for RawHealth {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 1.5,
            initial_delay_secs: 15,
            hysteresis_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawAutoSync {
    enabled: bool,
    idle_secs: i64,
    check_interval_secs: i64,
    min_pending: i64,
    connection_timeout_secs: i64,
}

impl Default for RawAutoSync {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: 30,
            check_interval_secs: 60,
            min_pending: 1,
            connection_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawRetry {
    enabled: bool,
    max_attempts: i64,
    backoff_secs: i64,
    max_consecutive_failures: i64,
    failure_cooldown_secs: i64,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_secs: 5,
            max_consecutive_failures: 5,
            failure_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawDuplicate {
    enabled: bool,
    window_secs: i64,
    action: DuplicateAction,
}

impl Default for RawDuplicate {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            action: DuplicateAction::Warn,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawDb {
    path: String,
}

impl Default for RawDb {
    fn default() -> Self {
        Self {
            path: "tally.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawServer {
    addr: String,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8787".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed (clamped) configuration
// ---------------------------------------------------------------------------

/// Duplicate-gate policy. An unparseable value is a config fault (fatal),
/// not a clampable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    Warn,
    Block,
    Silent,
}

impl DuplicateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateAction::Warn => "warn",
            DuplicateAction::Block => "block",
            DuplicateAction::Silent => "silent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub url: String,
    pub batch_size: usize,
    pub upload_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// `None` disables periodic probing (interval 0); manual probes still work.
    pub interval: Option<Duration>,
    pub timeout: Duration,
    pub initial_delay: Duration,
    pub hysteresis_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct AutoSyncConfig {
    pub enabled: bool,
    pub idle: Duration,
    pub check_interval: Duration,
    pub min_pending: i64,
    pub connection_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_consecutive_failures: u32,
    pub failure_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct DuplicateConfig {
    pub enabled: bool,
    pub window: Duration,
    pub action: DuplicateAction,
}

/// Immutable process-wide configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cloud: CloudConfig,
    pub station_name: String,
    pub health: HealthConfig,
    pub auto_sync: AutoSyncConfig,
    pub retry: RetryConfig,
    pub duplicate: DuplicateConfig,
    pub db_path: PathBuf,
    pub server_addr: SocketAddr,
    pub secrets: ResolvedSecrets,
    /// sha256 over the canonical merged document; echoed in the snapshot.
    pub config_hash: String,
}

/// The subset of configuration echoed to collaborators in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEcho {
    pub cloud_url: String,
    pub batch_size: usize,
    pub auto_sync_enabled: bool,
    pub duplicate_action: DuplicateAction,
    pub duplicate_window_secs: u64,
    pub config_hash: String,
}

impl AgentConfig {
    pub fn echo(&self) -> ConfigEcho {
        ConfigEcho {
            cloud_url: self.cloud.url.clone(),
            batch_size: self.cloud.batch_size,
            auto_sync_enabled: self.auto_sync.enabled,
            duplicate_action: self.duplicate.action,
            duplicate_window_secs: self.duplicate.window.as_secs(),
            config_hash: self.config_hash.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Environment overrides applied over the merged file layers. Values are
/// strings; numeric/boolean targets parse or the load fails (a config fault).
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("TALLY_CLOUD_URL", "/cloud/url", EnvKind::Str),
    ("TALLY_STATION_NAME", "/station/name", EnvKind::Str),
    ("TALLY_DB_PATH", "/db/path", EnvKind::Str),
    ("TALLY_SERVER_ADDR", "/server/addr", EnvKind::Str),
    ("TALLY_BATCH_SIZE", "/cloud/batch_size", EnvKind::Int),
    ("TALLY_AUTOSYNC_ENABLED", "/auto_sync/enabled", EnvKind::Bool),
    ("TALLY_DUPLICATE_ACTION", "/duplicate/action", EnvKind::Str),
];

#[derive(Clone, Copy)]
enum EnvKind {
    Str,
    Int,
    Bool,
}

fn apply_env_overrides(doc: &mut Value) -> Result<()> {
    for (var, pointer, kind) in ENV_OVERRIDES {
        let Ok(raw) = std::env::var(var) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let parsed = match kind {
            EnvKind::Str => Value::String(raw.to_string()),
            EnvKind::Int => Value::from(
                raw.parse::<i64>()
                    .with_context(|| format!("env override {var} is not an integer"))?,
            ),
            EnvKind::Bool => Value::Bool(match raw {
                "1" | "true" | "TRUE" | "True" => true,
                "0" | "false" | "FALSE" | "False" => false,
                other => bail!("env override {var} is not a boolean: {other}"),
            }),
        };
        write_pointer(doc, pointer, parsed);
    }
    Ok(())
}

/// Write `value` at `pointer`, creating intermediate objects as needed.
fn write_pointer(doc: &mut Value, pointer: &str, value: Value) {
    let mut cur = doc;
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        let map = cur.as_object_mut().expect("just coerced to object");
        if i == segments.len() - 1 {
            map.insert((*seg).to_string(), value);
            return;
        }
        cur = map
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}

// ---------------------------------------------------------------------------
// Clamping
// ---------------------------------------------------------------------------

fn clamp_i64(name: &str, v: i64, lo: i64, hi: i64) -> i64 {
    if v < lo || v > hi {
        let clamped = v.clamp(lo, hi);
        warn!(option = name, given = v, used = clamped, "config value out of range, clamped");
        clamped
    } else {
        v
    }
}

fn clamp_f64(name: &str, v: f64, lo: f64, hi: f64) -> f64 {
    if !v.is_finite() || v < lo || v > hi {
        let clamped = if v.is_finite() { v.clamp(lo, hi) } else { lo };
        warn!(option = name, given = v, used = clamped, "config value out of range, clamped");
        clamped
    } else {
        v
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Default layer paths: `tally.yaml` beside the executable, then `tally.yaml`
/// in the working directory.
pub fn default_layer_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join("tally.yaml"));
        }
    }
    paths.push(PathBuf::from("tally.yaml"));
    paths
}

/// Load, merge, clamp, and resolve the full agent configuration.
///
/// # Errors
/// Config faults are fatal: unreadable/unparseable layers, an unparseable
/// typed value, a missing `cloud.url`, an unresolvable bearer key, an
/// invalid station name, or an invalid listen address.
pub fn load(paths: &[&Path]) -> Result<AgentConfig> {
    let layers = load_layered_yaml(paths)?;
    from_layers(layers)
}

/// Build an [`AgentConfig`] from an already-merged document. Exposed so
/// tests can construct configs without touching the filesystem.
pub fn from_layers(layers: LoadedLayers) -> Result<AgentConfig> {
    let mut doc = layers.config_json;
    apply_env_overrides(&mut doc)?;
    let layers = finalize(doc)?;

    let raw: RawConfig = serde_json::from_value(layers.config_json.clone())
        .context("config document has an unparseable value")?;

    let Some(url) = raw.cloud.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        bail!("CONFIG_MISSING: cloud.url is required (set it in tally.yaml or TALLY_CLOUD_URL)");
    };

    let secrets = resolve_secrets(&layers.config_json)?;

    let station_name = raw.station.name.trim().to_string();
    if let Err(reason) = validate_station_name(&station_name) {
        bail!("CONFIG_INVALID: station.name: {reason}");
    }

    let server_addr: SocketAddr = raw
        .server
        .addr
        .parse()
        .with_context(|| format!("CONFIG_INVALID: server.addr '{}'", raw.server.addr))?;

    let health_interval = clamp_i64("health.interval_secs", raw.health.interval_secs, 0, 86_400);

    Ok(AgentConfig {
        cloud: CloudConfig {
            url: url.trim_end_matches('/').to_string(),
            batch_size: clamp_i64("cloud.batch_size", raw.cloud.batch_size, 1, 1000) as usize,
            upload_timeout: Duration::from_secs_f64(clamp_f64(
                "cloud.upload_timeout_secs",
                raw.cloud.upload_timeout_secs,
                1.0,
                60.0,
            )),
        },
        station_name,
        health: HealthConfig {
            interval: if health_interval == 0 {
                None
            } else {
                Some(Duration::from_secs(health_interval as u64))
            },
            timeout: Duration::from_secs_f64(clamp_f64(
                "health.timeout_secs",
                raw.health.timeout_secs,
                0.5,
                30.0,
            )),
            initial_delay: Duration::from_secs(clamp_i64(
                "health.initial_delay_secs",
                raw.health.initial_delay_secs,
                0,
                86_400,
            ) as u64),
            hysteresis_threshold: clamp_i64(
                "health.hysteresis_threshold",
                raw.health.hysteresis_threshold,
                1,
                100,
            ) as u32,
        },
        auto_sync: AutoSyncConfig {
            enabled: raw.auto_sync.enabled,
            idle: Duration::from_secs(
                clamp_i64("auto_sync.idle_secs", raw.auto_sync.idle_secs, 5, 3600) as u64,
            ),
            check_interval: Duration::from_secs(clamp_i64(
                "auto_sync.check_interval_secs",
                raw.auto_sync.check_interval_secs,
                10,
                3600,
            ) as u64),
            min_pending: clamp_i64("auto_sync.min_pending", raw.auto_sync.min_pending, 1, 10_000),
            connection_timeout: Duration::from_secs(clamp_i64(
                "auto_sync.connection_timeout_secs",
                raw.auto_sync.connection_timeout_secs,
                1,
                30,
            ) as u64),
        },
        retry: RetryConfig {
            enabled: raw.retry.enabled,
            max_attempts: clamp_i64("retry.max_attempts", raw.retry.max_attempts, 1, 10) as u32,
            backoff: Duration::from_secs(
                clamp_i64("retry.backoff_secs", raw.retry.backoff_secs, 1, 60) as u64,
            ),
            max_consecutive_failures: clamp_i64(
                "retry.max_consecutive_failures",
                raw.retry.max_consecutive_failures,
                1,
                100,
            ) as u32,
            failure_cooldown: Duration::from_secs(clamp_i64(
                "retry.failure_cooldown_secs",
                raw.retry.failure_cooldown_secs,
                30,
                3600,
            ) as u64),
        },
        duplicate: DuplicateConfig {
            enabled: raw.duplicate.enabled,
            window: Duration::from_secs(clamp_i64(
                "duplicate.window_secs",
                raw.duplicate.window_secs,
                1,
                3600,
            ) as u64),
            action: raw.duplicate.action,
        },
        db_path: PathBuf::from(raw.db.path),
        server_addr,
        secrets,
        config_hash: layers.config_hash,
    })
}
