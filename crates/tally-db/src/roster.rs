//! Roster snapshot verbs.
//!
//! The roster is populated by an external importer; the core only reads it
//! (membership lookups and the search used for non-numeric intake input)
//! and records its fingerprint in the metadata KV when notified of a
//! replacement.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Store;

/// A roster row surfaced to intake: the badge id plus its opaque payload.
#[derive(Clone, Debug)]
pub struct RosterCandidate {
    pub badge_id: String,
    pub payload: Value,
}

impl Store {
    /// Replace the roster wholesale and refresh the stored roster hash.
    /// Called from the importer's notification path.
    pub async fn replace_roster(&self, entries: &[(String, Value)]) -> Result<String> {
        let mut tx = self.pool().begin().await.context("begin replace_roster")?;

        sqlx::query("DELETE FROM roster")
            .execute(&mut *tx)
            .await
            .context("clear roster")?;

        for (badge_id, payload) in entries {
            sqlx::query("INSERT INTO roster (badge_id, payload) VALUES (?, ?)")
                .bind(badge_id)
                .bind(payload.to_string())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("insert roster entry {badge_id}"))?;
        }

        tx.commit().await.context("commit replace_roster")?;

        let hash = roster_hash(entries);
        self.meta_set("roster_hash", &hash).await?;
        Ok(hash)
    }

    /// Membership lookup: the opaque payload for a badge, if rostered.
    pub async fn roster_lookup(&self, badge_id: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM roster WHERE badge_id = ?")
                .bind(badge_id)
                .fetch_optional(self.pool())
                .await
                .context("roster_lookup")?;
        match row {
            Some((payload,)) => Ok(Some(
                serde_json::from_str(&payload).unwrap_or(Value::Null),
            )),
            None => Ok(None),
        }
    }

    /// Case-insensitive substring search over badge ids and payloads.
    /// Serves the intake path for non-numeric operator input.
    pub async fn roster_search(&self, query: &str, limit: usize) -> Result<Vec<RosterCandidate>> {
        let pattern = format!("%{}%", query.replace('%', "").replace('_', ""));
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT badge_id, payload FROM roster \
             WHERE badge_id LIKE ?1 OR payload LIKE ?1 \
             ORDER BY badge_id LIMIT ?2",
        )
        .bind(&pattern)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .context("roster_search")?;

        Ok(rows
            .into_iter()
            .map(|(badge_id, payload)| RosterCandidate {
                badge_id,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            })
            .collect())
    }

    pub async fn roster_count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM roster")
            .fetch_one(self.pool())
            .await
            .context("roster_count")?;
        Ok(n)
    }
}

/// Deterministic fingerprint of a roster snapshot: sha256 over the sorted
/// `badge_id=payload` lines.
fn roster_hash(entries: &[(String, Value)]) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|(badge, payload)| format!("{badge}={payload}"))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
