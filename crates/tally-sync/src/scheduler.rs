//! Idle-triggered auto-sync scheduler.
//!
//! A periodic tick evaluates the trigger conditions and invokes the engine
//! only when all hold: auto-sync enabled, intake idle long enough, enough
//! pending scans, engine not in cooldown, single-flight lock free. The
//! scheduler never probes connectivity itself; that is the engine's cycle
//! contract. Rapid new scans simply refresh the activity clock and defer
//! work to a later tick.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tally_config::AutoSyncConfig;
use tally_db::Store;

use crate::engine::SyncEngine;

// ---------------------------------------------------------------------------
// ActivityTracker
// ---------------------------------------------------------------------------

/// Millisecond-resolution record of the last successful insert. Written by
/// intake, read lock-free by scheduler ticks.
pub struct ActivityTracker {
    last_activity_ms: AtomicI64,
}

impl ActivityTracker {
    /// Starts "active now" so the first idle window is measured from boot.
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
        })
    }

    pub fn note_activity(&self, now: DateTime<Utc>) {
        self.last_activity_ms
            .store(now.timestamp_millis(), Ordering::Release);
    }

    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        let delta_ms = now.timestamp_millis().saturating_sub(last);
        Duration::from_millis(delta_ms.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// AutoSyncScheduler
// ---------------------------------------------------------------------------

pub struct AutoSyncScheduler {
    cfg: AutoSyncConfig,
    engine: Arc<SyncEngine>,
    store: Store,
    activity: Arc<ActivityTracker>,
}

impl AutoSyncScheduler {
    pub fn new(
        cfg: AutoSyncConfig,
        engine: Arc<SyncEngine>,
        store: Store,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            cfg,
            engine,
            store,
            activity,
        }
    }

    /// Tick loop. Returns on cancellation; a storage fault propagates out
    /// (fatal at the process level).
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if !self.cfg.enabled {
            info!("auto-sync disabled");
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.cfg.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if let Some(summary) = self.evaluate_tick().await? {
                info!(
                    synced = summary.synced,
                    failed = summary.failed,
                    remaining = summary.remaining_pending,
                    skipped = summary.skipped,
                    "auto-sync cycle",
                );
            }
        }
    }

    /// One tick's condition check; invokes the engine when all gates pass.
    /// Split out for scenario tests that drive ticks directly.
    pub async fn evaluate_tick(&self) -> Result<Option<crate::engine::CycleSummary>> {
        let now = Utc::now();

        let idle = self.activity.idle_duration(now);
        if idle < self.cfg.idle {
            debug!(idle_ms = idle.as_millis() as u64, "not idle long enough");
            return Ok(None);
        }

        let pending = self.store.count_by_status().await?.pending;
        if pending < self.cfg.min_pending {
            debug!(pending, min = self.cfg.min_pending, "below pending threshold");
            return Ok(None);
        }

        if self.engine.in_cooldown() {
            debug!("engine in cooldown; deferring");
            return Ok(None);
        }

        if self.engine.is_busy() {
            debug!("engine busy; deferring");
            return Ok(None);
        }

        Ok(Some(self.engine.sync_pending(true, None).await?))
    }
}
