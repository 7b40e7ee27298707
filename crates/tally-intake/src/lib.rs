//! Scan intake: the admission path from operator input to the store.
//!
//! Normalization, badge-form validation, duplicate gating, roster lookup,
//! insert, and response assembly, in that order, with a single `now`
//! computed per submission so the duplicate-window query and the record
//! timestamp can never disagree.
//!
//! Admission faults are results, not errors: a rejected input returns
//! `{ok: false, reason}` with no storage effect. Only storage faults
//! propagate as `Err` (fatal upstream). Duplicate rejection is an
//! informative result, never an error.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use tally_config::{DuplicateAction, DuplicateConfig};
use tally_db::Store;
use tally_schemas::time::to_canonical;
use tally_schemas::{Scan, Signal};
use tally_sync::ActivityTracker;

/// Bounded length of the recent-history tail in every response.
const RECENT_LIMIT: usize = 10;

/// Maximum badge identifier length after normalization.
const BADGE_MAX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// One entry of the recent-history tail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecentScan {
    pub local_id: i64,
    pub badge_id: String,
    /// Canonical RFC3339 UTC text.
    pub scanned_at: String,
    pub matched: bool,
}

impl From<&Scan> for RecentScan {
    fn from(scan: &Scan) -> Self {
        Self {
            local_id: scan.local_id,
            badge_id: scan.badge_id.clone(),
            scanned_at: to_canonical(&scan.scanned_at_utc),
            matched: scan.matched,
        }
    }
}

/// Result of one submission. `ok: false` means the input was not recorded;
/// `reason` says why. A blocked duplicate sets `is_duplicate` alongside.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge_id: Option<String>,
    pub matched: bool,
    /// Opaque roster payload, verbatim, for matched badges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendee: Option<serde_json::Value>,
    pub today_count: i64,
    pub total_count: i64,
    pub recent: Vec<RecentScan>,
}

// ---------------------------------------------------------------------------
// ScanIntake
// ---------------------------------------------------------------------------

pub struct ScanIntake {
    store: Store,
    station_name: String,
    dup: DuplicateConfig,
    activity: Arc<ActivityTracker>,
    bus: broadcast::Sender<Signal>,
}

impl ScanIntake {
    pub fn new(
        store: Store,
        station_name: String,
        dup: DuplicateConfig,
        activity: Arc<ActivityTracker>,
        bus: broadcast::Sender<Signal>,
    ) -> Self {
        Self {
            store,
            station_name,
            dup,
            activity,
            bus,
        }
    }

    pub async fn submit_scan(&self, raw: &str) -> Result<ScanResponse> {
        self.submit_scan_at(raw, Utc::now()).await
    }

    /// Submission with an injected clock, for tests and replays.
    pub async fn submit_scan_at(&self, raw: &str, now: DateTime<Utc>) -> Result<ScanResponse> {
        // 1. Normalize and admit.
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return self.rejected("empty badge input", now).await;
        }
        if trimmed.chars().count() > BADGE_MAX_LEN {
            return self
                .rejected("badge identifier exceeds 64 characters", now)
                .await;
        }
        if trimmed.contains('\n') || trimmed.contains('\r') {
            return self
                .rejected("badge identifier contains line breaks", now)
                .await;
        }

        // 2. Resolve the badge. Numeric input is an identifier directly;
        //    anything else goes through roster search and resolves only on
        //    an unambiguous hit.
        let badge_id = if trimmed.chars().all(|c| c.is_ascii_digit()) {
            trimmed.to_string()
        } else {
            let candidates = self.store.roster_search(trimmed, 2).await?;
            if candidates.len() == 1 {
                candidates.into_iter().next().map(|c| c.badge_id).unwrap_or_default()
            } else {
                // Zero or ambiguous: record the raw input as an unmatched scan.
                trimmed.to_string()
            }
        };

        // 3–4. Duplicate gating, sharing `now` with the record timestamp.
        let mut duplicate_seen = false;
        if self.dup.enabled {
            let window = ChronoDuration::from_std(self.dup.window).unwrap_or_default();
            let since = now - window;
            if self
                .store
                .recent_same_badge(&badge_id, &self.station_name, since)
                .await?
            {
                duplicate_seen = true;
                match self.dup.action {
                    DuplicateAction::Block => {
                        self.emit_duplicate(&badge_id, now);
                        let mut resp = self.base_response(now).await?;
                        resp.ok = false;
                        resp.is_duplicate = true;
                        resp.badge_id = Some(badge_id);
                        return Ok(resp);
                    }
                    DuplicateAction::Warn => {
                        self.emit_duplicate(&badge_id, now);
                    }
                    DuplicateAction::Silent => {
                        debug!(badge = %badge_id, "duplicate scan admitted silently");
                    }
                }
            }
        }

        // 5. Roster membership and payload.
        let attendee = self.store.roster_lookup(&badge_id).await?;
        let matched = attendee.is_some();

        // 6. Record and announce.
        let scan = self
            .store
            .insert_scan(&badge_id, &self.station_name, now, matched)
            .await?;
        self.activity.note_activity(now);
        debug!(badge = %scan.badge_id, local_id = scan.local_id, matched, "scan recorded");

        // 7. Respond.
        let mut resp = self.base_response(now).await?;
        resp.ok = true;
        resp.is_duplicate = duplicate_seen && self.dup.action != DuplicateAction::Silent;
        resp.badge_id = Some(scan.badge_id);
        resp.matched = matched;
        resp.attendee = attendee;
        Ok(resp)
    }

    async fn rejected(&self, reason: &str, now: DateTime<Utc>) -> Result<ScanResponse> {
        let mut resp = self.base_response(now).await?;
        resp.ok = false;
        resp.reason = Some(reason.to_string());
        Ok(resp)
    }

    /// Totals and the recent tail; shared by every response shape.
    async fn base_response(&self, now: DateTime<Utc>) -> Result<ScanResponse> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let today_count = self.store.count_since(day_start).await?;
        let total_count = self.store.count_by_status().await?.total();
        let recent = self
            .store
            .recent_scans(RECENT_LIMIT)
            .await?
            .iter()
            .map(RecentScan::from)
            .collect();

        Ok(ScanResponse {
            ok: false,
            reason: None,
            is_duplicate: false,
            badge_id: None,
            matched: false,
            attendee: None,
            today_count,
            total_count,
            recent,
        })
    }

    fn emit_duplicate(&self, badge_id: &str, now: DateTime<Utc>) {
        let _ = self.bus.send(Signal::DuplicateDetected {
            badge_id: badge_id.to_string(),
            station_name: self.station_name.clone(),
            scanned_at: to_canonical(&now),
        });
    }
}
