//! Durable local store for the tally agent.
//!
//! One SQLite file holds everything the agent persists: the scan ledger,
//! the station identity, the roster snapshot, and a small metadata KV.
//! Access is partitioned by entity behind a small set of verbs (`scans`,
//! `station`, `roster` modules); writes serialize through SQLite's writer
//! lock (WAL journal, busy timeout) which preserves `local_id`
//! monotonicity, while readers proceed concurrently against a consistent
//! snapshot.
//!
//! Every operation either commits or returns `Err` with context; callers
//! in the binaries treat storage errors as fatal; partial state is never
//! exposed.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

mod roster;
mod scans;
mod station;

pub use roster::RosterCandidate;

/// Shared handle to the agent's SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and migrate the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run embedded migrations. Forward-only and idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("store migrate failed")?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Metadata KV
    // -----------------------------------------------------------------------

    pub async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("meta_get {key}"))?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("meta_set {key}"))?;
        Ok(())
    }
}
