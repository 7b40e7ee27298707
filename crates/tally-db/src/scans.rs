//! Scan ledger verbs.
//!
//! The lifecycle guard is in the SQL itself: `mark_synced` and `mark_failed`
//! only touch rows still in `pending`, so replayed or stale transition
//! requests skip silently and `synced` stays terminal. Both run inside one
//! transaction per batch: a batch either fully transitions or not at all.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use tally_schemas::time::to_canonical;
use tally_schemas::{idempotency_key, Scan, StatusCounts, SyncStatus};

use crate::Store;

type ScanRow = (
    i64,
    String,
    String,
    String,
    bool,
    String,
    Option<String>,
    Option<String>,
    i64,
);

const SCAN_COLUMNS: &str = "local_id, badge_id, station_name, scanned_at_utc, matched, \
     sync_status, idempotency_key, last_error, attempt_count";

fn row_to_scan(row: ScanRow) -> Result<Scan> {
    let (local_id, badge_id, station_name, scanned_at, matched, status, key, last_error, attempts) =
        row;
    Ok(Scan {
        local_id,
        badge_id,
        station_name,
        scanned_at_utc: tally_schemas::time::parse_canonical(&scanned_at)
            .with_context(|| format!("unparseable stored timestamp for scan {local_id}"))?,
        matched,
        sync_status: SyncStatus::parse(&status)
            .with_context(|| format!("unknown sync_status '{status}' for scan {local_id}"))?,
        idempotency_key: key.unwrap_or_default(),
        last_error,
        attempt_count: attempts,
    })
}

impl Store {
    /// Insert a new scan: assigns the next `local_id`, derives the
    /// idempotency key from it, and initializes the lifecycle to `pending`.
    /// The rowid assignment and key derivation commit atomically.
    pub async fn insert_scan(
        &self,
        badge_id: &str,
        station_name: &str,
        now_utc: DateTime<Utc>,
        matched: bool,
    ) -> Result<Scan> {
        let scanned_at = to_canonical(&now_utc);

        let mut tx = self.pool().begin().await.context("begin insert_scan")?;

        let res = sqlx::query(
            "INSERT INTO scans (badge_id, station_name, scanned_at_utc, matched) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(badge_id)
        .bind(station_name)
        .bind(&scanned_at)
        .bind(matched)
        .execute(&mut *tx)
        .await
        .context("insert scan row")?;

        let local_id = res.last_insert_rowid();
        let key = idempotency_key(station_name, badge_id, local_id);

        sqlx::query("UPDATE scans SET idempotency_key = ? WHERE local_id = ?")
            .bind(&key)
            .bind(local_id)
            .execute(&mut *tx)
            .await
            .context("assign idempotency key")?;

        tx.commit().await.context("commit insert_scan")?;

        Ok(Scan {
            local_id,
            badge_id: badge_id.to_string(),
            station_name: station_name.to_string(),
            scanned_at_utc: now_utc,
            matched,
            sync_status: SyncStatus::Pending,
            idempotency_key: key,
            last_error: None,
            attempt_count: 0,
        })
    }

    /// Up to `limit` pending scans, oldest first by `local_id`.
    pub async fn fetch_pending(&self, limit: usize) -> Result<Vec<Scan>> {
        let rows: Vec<ScanRow> = sqlx::query_as(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE sync_status = 'pending' ORDER BY local_id ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .context("fetch_pending")?;

        rows.into_iter().map(row_to_scan).collect()
    }

    /// Transition the listed scans `pending → synced`. Non-pending rows are
    /// skipped silently. Returns the number of rows transitioned.
    pub async fn mark_synced(&self, local_ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool().begin().await.context("begin mark_synced")?;
        let mut changed = 0u64;
        for id in local_ids {
            let res = sqlx::query(
                "UPDATE scans SET sync_status = 'synced', last_error = NULL \
                 WHERE local_id = ? AND sync_status = 'pending'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("mark_synced {id}"))?;
            changed += res.rows_affected();
        }
        tx.commit().await.context("commit mark_synced")?;
        Ok(changed)
    }

    /// Transition the listed scans `pending → failed`, recording the error
    /// and bumping the attempt counter. Non-pending rows are skipped.
    pub async fn mark_failed(&self, local_ids: &[i64], error_text: &str) -> Result<u64> {
        let mut tx = self.pool().begin().await.context("begin mark_failed")?;
        let mut changed = 0u64;
        for id in local_ids {
            let res = sqlx::query(
                "UPDATE scans SET sync_status = 'failed', last_error = ?, \
                 attempt_count = attempt_count + 1 \
                 WHERE local_id = ? AND sync_status = 'pending'",
            )
            .bind(error_text)
            .bind(id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("mark_failed {id}"))?;
            changed += res.rows_affected();
        }
        tx.commit().await.context("commit mark_failed")?;
        Ok(changed)
    }

    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT sync_status, COUNT(*) FROM scans GROUP BY sync_status")
                .fetch_all(self.pool())
                .await
                .context("count_by_status")?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "pending" => counts.pending = n,
                "synced" => counts.synced = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// True iff a scan with this badge and station exists strictly newer
    /// than `since_utc`. The bound is exclusive: a prior scan exactly at
    /// the window edge is not a duplicate. The bound binds through the
    /// canonical serializer, the same one the insert path writes with.
    pub async fn recent_same_badge(
        &self,
        badge_id: &str,
        station_name: &str,
        since_utc: DateTime<Utc>,
    ) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM scans \
             WHERE badge_id = ? AND station_name = ? AND scanned_at_utc > ?)",
        )
        .bind(badge_id)
        .bind(station_name)
        .bind(to_canonical(&since_utc))
        .fetch_one(self.pool())
        .await
        .context("recent_same_badge")?;
        Ok(exists)
    }

    /// Administrative: `failed → pending` for every failed scan.
    pub async fn reset_failed_to_pending(&self) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE scans SET sync_status = 'pending', last_error = NULL \
             WHERE sync_status = 'failed'",
        )
        .execute(self.pool())
        .await
        .context("reset_failed_to_pending")?;
        Ok(res.rows_affected())
    }

    /// Administrative: delete every scan and restart the id sequence.
    pub async fn purge_all_scans(&self) -> Result<u64> {
        let mut tx = self.pool().begin().await.context("begin purge_all_scans")?;
        let res = sqlx::query("DELETE FROM scans")
            .execute(&mut *tx)
            .await
            .context("purge scans")?;
        // Restart local_id at 1 for the next identity epoch.
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'scans'")
            .execute(&mut *tx)
            .await
            .context("reset scan sequence")?;
        tx.commit().await.context("commit purge_all_scans")?;
        Ok(res.rows_affected())
    }

    /// Scans recorded at or after `day_start_utc` (running "today" total).
    pub async fn count_since(&self, day_start_utc: DateTime<Utc>) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scans WHERE scanned_at_utc >= ?")
            .bind(to_canonical(&day_start_utc))
            .fetch_one(self.pool())
            .await
            .context("count_since")?;
        Ok(n)
    }

    /// The most recent `limit` scans, newest first: the bounded history
    /// tail returned to the display surface.
    pub async fn recent_scans(&self, limit: usize) -> Result<Vec<Scan>> {
        let rows: Vec<ScanRow> = sqlx::query_as(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans ORDER BY local_id DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .context("recent_scans")?;

        rows.into_iter().map(row_to_scan).collect()
    }
}
