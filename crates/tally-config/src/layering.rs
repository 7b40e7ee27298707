//! Layered YAML loading.
//!
//! Config files are merged in precedence order (executable directory first,
//! then working directory), with later layers folded over earlier ones and
//! environment variables applied last. The merged document is canonicalized
//! (deterministic key order, compact JSON) and hashed so the agent can echo
//! a stable config fingerprint in its snapshot.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Merged + canonicalized configuration document.
#[derive(Debug, Clone)]
pub struct LoadedLayers {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load and merge the YAML layers that exist; absent files are skipped.
/// Later paths override earlier paths, section by section.
pub fn load_layered_yaml(paths: &[&Path]) -> Result<LoadedLayers> {
    let mut merged = Value::Object(Default::default());

    for path in paths {
        match read_layer(path)? {
            Some(layer) => merge_layer(&mut merged, layer),
            None => tracing::debug!(path = %path.display(), "config layer absent, skipping"),
        }
    }

    finalize(merged)
}

/// One YAML layer as JSON, or `None` when the file does not exist.
fn read_layer(path: &Path) -> Result<Option<Value>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("config layer {} unreadable", path.display()))
        }
    };
    let parsed: serde_yaml::Value = serde_yaml::from_str(&text)
        .with_context(|| format!("config layer {} is not valid yaml", path.display()))?;
    serde_json::to_value(parsed)
        .map(Some)
        .with_context(|| format!("config layer {} did not convert to json", path.display()))
}

/// Canonicalize and hash an already-merged document. Split out so env
/// overrides can be applied between merging and hashing.
pub fn finalize(merged: Value) -> Result<LoadedLayers> {
    let config_json = canonical_value(merged);
    let canonical_json =
        serde_json::to_string(&config_json).context("canonical json encode failed")?;

    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    Ok(LoadedLayers {
        config_json,
        canonical_json,
        config_hash,
    })
}

/// Fold one overlay document into the accumulated layers.
///
/// The config is a tree of sections holding scalar options, so two objects
/// merge member by member; anything else in the overlay (a scalar, or an
/// array should one ever appear) takes the slot wholesale. A section in the
/// overlay also replaces a scalar of the same name in the base.
fn merge_layer(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Object(overlay_map) => {
            if let Value::Object(base_map) = base {
                for (key, value) in overlay_map {
                    match base_map.get_mut(&key) {
                        Some(slot) => merge_layer(slot, value),
                        None => {
                            base_map.insert(key, value);
                        }
                    }
                }
            } else {
                *base = Value::Object(overlay_map);
            }
        }
        scalar_or_array => *base = scalar_or_array,
    }
}

/// Rebuild the document with deterministic member order so the hash does
/// not depend on which layer contributed which key. Objects pass through a
/// `BTreeMap` (sorted iteration), arrays keep their element order.
fn canonical_value(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(key, member)| (key, canonical_value(member)))
                .collect();
            Value::Object(ordered.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_value).collect()),
        scalar => scalar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_layer_overrides_earlier_scalars() {
        let mut base = json!({"cloud": {"url": "https://a", "batch_size": 100}});
        merge_layer(&mut base, json!({"cloud": {"url": "https://b"}}));
        assert_eq!(base["cloud"]["url"], "https://b");
        assert_eq!(base["cloud"]["batch_size"], 100);
    }

    #[test]
    fn overlay_section_replaces_base_scalar() {
        let mut base = json!({"cloud": "legacy"});
        merge_layer(&mut base, json!({"cloud": {"url": "https://b"}}));
        assert_eq!(base["cloud"]["url"], "https://b");
    }

    #[test]
    fn canonical_hash_is_order_independent() {
        let a = finalize(json!({"b": 1, "a": {"y": 2, "x": 3}})).unwrap();
        let b = finalize(json!({"a": {"x": 3, "y": 2}, "b": 1})).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
        assert_eq!(a.canonical_json, r#"{"a":{"x":3,"y":2},"b":1}"#);
    }
}
