//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only env var **NAMES** (e.g. `"TALLY_CLOUD_KEY"`).
//! - Callers invoke [`resolve_secrets`] once at startup; the returned
//!   [`ResolvedSecrets`] is passed into constructors. No `std::env::var`
//!   calls anywhere else.
//! - `Debug` impls redact values; error messages reference the env var
//!   NAME, never the value.
//!
//! The cloud bearer key is **required**: the agent cannot upload without
//! it, so a missing key is fatal at startup. The admin PIN is optional;
//! when unresolved, the station-reset operation refuses all requests.

use anyhow::{bail, Result};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A resolved secret value with a redacted `Debug`.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Access the raw value. Call sites should be the HTTP header builder
    /// and the PIN comparison, nothing that formats or logs.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<REDACTED>")
    }
}

// ---------------------------------------------------------------------------
// ResolvedSecrets
// ---------------------------------------------------------------------------

/// All env-resolved secrets for one agent process.
#[derive(Clone, Debug)]
pub struct ResolvedSecrets {
    /// Bearer credential for the cloud batch endpoint.
    pub cloud_key: Secret,
    /// Optional PIN gating the administrative station reset.
    pub admin_pin: Option<Secret>,
}

/// The env var NAME configured at `pointer`, or the conventional default
/// when the config leaves it out (or blank).
fn configured_var_name(config: &Value, pointer: &str, fallback: &str) -> String {
    match config.pointer(pointer).and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => fallback.to_string(),
    }
}

/// Look a secret up by env var name. A blank value counts as unset; the
/// value goes straight into a [`Secret`] and never into an error path.
fn lookup(var_name: &str) -> Option<Secret> {
    std::env::var(var_name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(Secret::new)
}

/// Resolve all secrets from the environment.
///
/// # Errors
/// Returns `Err` naming the env var of the missing cloud key. The value is
/// never mentioned.
pub fn resolve_secrets(config_json: &Value) -> Result<ResolvedSecrets> {
    let cloud_key_var = configured_var_name(config_json, "/cloud/key_env", "TALLY_CLOUD_KEY");
    let admin_pin_var = configured_var_name(config_json, "/admin/pin_env", "TALLY_ADMIN_PIN");

    let Some(cloud_key) = lookup(&cloud_key_var) else {
        bail!(
            "CONFIG_MISSING_SECRET: required env var '{cloud_key_var}' \
             (cloud bearer key) is not set or empty",
        );
    };

    Ok(ResolvedSecrets {
        cloud_key,
        admin_pin: lookup(&admin_pin_var),
    })
}
