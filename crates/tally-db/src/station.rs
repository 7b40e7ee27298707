//! Station identity.
//!
//! Exactly one station identity per store, written on first launch and
//! immutable afterwards; changing it requires the administrative reset,
//! which also purges prior scans (their idempotency keys embed the old
//! station name and must not leak into the new identity's stream).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

use tally_schemas::time::to_canonical;

use crate::Store;

impl Store {
    /// The persisted station name, if one has been established.
    pub async fn station(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT station_name FROM station WHERE id = 1")
                .fetch_optional(self.pool())
                .await
                .context("read station identity")?;
        Ok(row.map(|(name,)| name))
    }

    /// Establish the station identity on first launch, or return the
    /// persisted one. A configured name that differs from the persisted
    /// identity is ignored with a warning; identity changes go through
    /// [`Store::reset_station`].
    pub async fn ensure_station(
        &self,
        configured_name: &str,
        now_utc: DateTime<Utc>,
    ) -> Result<String> {
        if let Some(existing) = self.station().await? {
            if existing != configured_name {
                warn!(
                    persisted = %existing,
                    configured = %configured_name,
                    "configured station name differs from persisted identity; keeping persisted",
                );
            }
            return Ok(existing);
        }

        sqlx::query("INSERT INTO station (id, station_name, created_at_utc) VALUES (1, ?, ?)")
            .bind(configured_name)
            .bind(to_canonical(&now_utc))
            .execute(self.pool())
            .await
            .context("persist station identity")?;
        Ok(configured_name.to_string())
    }

    /// Administrative reset: purge all scans and re-identify the station.
    pub async fn reset_station(&self, new_name: &str, now_utc: DateTime<Utc>) -> Result<()> {
        self.purge_all_scans().await?;
        sqlx::query(
            "INSERT INTO station (id, station_name, created_at_utc) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET station_name = excluded.station_name, \
             created_at_utc = excluded.created_at_utc",
        )
        .bind(new_name)
        .bind(to_canonical(&now_utc))
        .execute(self.pool())
        .await
        .context("reset station identity")?;
        Ok(())
    }
}
