//! The sync engine: a single-flight batch uploader.
//!
//! One cycle = probe, then drain pending scans in `local_id` order, one
//! batch at a time, applying lifecycle transitions per the outcome
//! classification. Exactly one cycle may execute per process; a concurrent
//! invocation is rejected immediately with `{skipped, reason: busy}`.
//!
//! Cooldown: a cycle that ends on an authentication halt or transient
//! exhaustion counts as a consecutive failure; at the configured threshold
//! the engine enters cooldown and the scheduler stays away until the timer
//! expires. An offline skip performs no work and does not count. Manual
//! invocation bypasses cooldown, never the single-flight lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_cloud::{CloudClient, UploadOutcome};
use tally_config::AgentConfig;
use tally_db::Store;
use tally_schemas::time::to_canonical;
use tally_schemas::wire::{BatchEvent, BatchRequest, EventMeta};
use tally_schemas::Scan;

use crate::backoff::jittered_backoff;
use crate::fsm::{EngineEvent, EngineFsm, EngineState};

// ---------------------------------------------------------------------------
// CycleSummary
// ---------------------------------------------------------------------------

/// Why a cycle performed no work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    /// Another cycle holds the single-flight lock.
    Busy,
    /// The pre-cycle reachability probe failed; pending scans untouched.
    Offline,
    /// The engine is in consecutive-failure cooldown.
    Cooldown,
}

/// Result of one engine invocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub synced: u64,
    pub failed: u64,
    pub batches: u64,
    pub remaining_pending: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub auth_failed: bool,
}

impl CycleSummary {
    fn skip(reason: SkipReason, remaining_pending: i64) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason),
            remaining_pending,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Store,
    client: CloudClient,
    cfg: AgentConfig,
    cycle_lock: tokio::sync::Mutex<()>,
    fsm: Mutex<EngineFsm>,
    consecutive_failures: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// `cancel` aborts backoff waits; a cancelled wait leaves the batch
    /// pending and ends the cycle.
    pub fn new(
        store: Store,
        client: CloudClient,
        cfg: AgentConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            cfg,
            cycle_lock: tokio::sync::Mutex::new(()),
            fsm: Mutex::new(EngineFsm::new()),
            consecutive_failures: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
            cancel,
        })
    }

    /// Current FSM state (observability only).
    pub fn state(&self) -> EngineState {
        self.fsm.lock().map(|g| g.state()).unwrap_or(EngineState::Idle)
    }

    /// Whether a cycle currently holds the single-flight lock.
    pub fn is_busy(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Whether the engine is in consecutive-failure cooldown. Expiry is
    /// detected lazily here: the first check past the deadline returns the
    /// engine to idle and resets the failure counter.
    pub fn in_cooldown(&self) -> bool {
        let mut until = match self.cooldown_until.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *until {
            Some(t) if Instant::now() >= t => {
                *until = None;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.apply(EngineEvent::CooldownExpired);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Scheduler-facing invocation: respects cooldown.
    ///
    /// `all = false` uploads at most one batch; `max_batches` bounds the
    /// drain regardless of `all`.
    pub async fn sync_pending(&self, all: bool, max_batches: Option<u64>) -> Result<CycleSummary> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Ok(CycleSummary::skip(SkipReason::Busy, 0));
        };
        if self.in_cooldown() {
            let remaining = self.store.count_by_status().await?.pending;
            return Ok(CycleSummary::skip(SkipReason::Cooldown, remaining));
        }
        self.cycle_body(all, max_batches).await
    }

    /// Manual invocation: bypasses cooldown, never the single-flight lock.
    /// Bypassing ends the cooldown; the failure counter restarts from the
    /// manual cycle's own outcome.
    pub async fn sync_now(&self) -> Result<CycleSummary> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Ok(CycleSummary::skip(SkipReason::Busy, 0));
        };
        self.clear_cooldown();
        self.cycle_body(true, None).await
    }

    /// Shutdown drain: waits up to `lock_wait` for the single-flight lock,
    /// then drains up to `max_batches`. Returns `None` when the lock could
    /// not be acquired in time.
    pub async fn drain(
        &self,
        max_batches: u64,
        lock_wait: Duration,
    ) -> Result<Option<CycleSummary>> {
        match tokio::time::timeout(lock_wait, self.cycle_lock.lock()).await {
            Ok(_guard) => {
                self.clear_cooldown();
                Ok(Some(self.cycle_body(true, Some(max_batches)).await?))
            }
            Err(_) => Ok(None),
        }
    }

    /// End any active cooldown (manual bypass or shutdown drain).
    fn clear_cooldown(&self) {
        let mut until = match self.cooldown_until.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if until.take().is_some() {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.apply(EngineEvent::CooldownExpired);
        }
    }

    // -----------------------------------------------------------------------
    // Cycle body (single-flight lock held by the caller)
    // -----------------------------------------------------------------------

    async fn cycle_body(&self, all: bool, max_batches: Option<u64>) -> Result<CycleSummary> {
        self.apply(EngineEvent::Start);

        if let Err(probe) = self.client.probe(self.cfg.auto_sync.connection_timeout).await {
            debug!(%probe, "cycle skipped: endpoint unreachable");
            self.apply(EngineEvent::Unreachable);
            let remaining = self.store.count_by_status().await?.pending;
            return Ok(CycleSummary::skip(SkipReason::Offline, remaining));
        }
        self.apply(EngineEvent::Reachable);

        let mut summary = CycleSummary::default();
        let mut cycle_failed = false;
        let mut aborted = false;
        let max_attempts = if self.cfg.retry.enabled {
            self.cfg.retry.max_attempts
        } else {
            1
        };

        'batches: loop {
            if let Some(max) = max_batches {
                if summary.batches >= max {
                    break;
                }
            }

            let scans = self.store.fetch_pending(self.cfg.cloud.batch_size).await?;
            if scans.is_empty() {
                break;
            }
            let ids: Vec<i64> = scans.iter().map(|s| s.local_id).collect();
            let batch = build_batch(&scans);

            // Attempts are counted per batch, not per cycle.
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let outcome = self
                    .client
                    .upload_batch(&batch, self.cfg.cloud.upload_timeout)
                    .await;

                match &outcome {
                    UploadOutcome::Accepted(ack) => {
                        let n = self.store.mark_synced(&ids).await?;
                        summary.synced += n;
                        summary.batches += 1;
                        debug!(
                            batch_len = ids.len(),
                            saved = ack.saved,
                            duplicates = ack.duplicates,
                            "batch accepted"
                        );
                        self.apply(EngineEvent::BatchOk);
                        break;
                    }

                    UploadOutcome::AuthRejected { .. } => {
                        let msg = outcome.describe();
                        let n = self.store.mark_failed(&ids, &msg).await?;
                        summary.failed += n;
                        summary.batches += 1;
                        summary.auth_failed = true;
                        summary.last_error = Some(msg.clone());
                        cycle_failed = true;
                        aborted = true;
                        warn!(%msg, "authentication rejected; halting cycle");
                        self.apply(EngineEvent::Aborted);
                        break 'batches;
                    }

                    UploadOutcome::ClientRejected { .. }
                    | UploadOutcome::MalformedResponse { .. } => {
                        let msg = outcome.describe();
                        let n = self.store.mark_failed(&ids, &msg).await?;
                        summary.failed += n;
                        summary.batches += 1;
                        summary.last_error = Some(msg.clone());
                        warn!(%msg, batch_len = ids.len(), "batch permanently rejected");
                        break; // next batch
                    }

                    UploadOutcome::TransientService { .. }
                    | UploadOutcome::TransientNetwork { .. } => {
                        let msg = outcome.describe();
                        if attempt >= max_attempts {
                            // Exhausted: the batch stays pending for a
                            // later cycle.
                            summary.last_error = Some(msg.clone());
                            cycle_failed = true;
                            aborted = true;
                            warn!(%msg, attempt, "transient failure exhausted retries; leaving batch pending");
                            self.apply(EngineEvent::Aborted);
                            break 'batches;
                        }

                        let delay = jittered_backoff(self.cfg.retry.backoff, attempt);
                        debug!(%msg, attempt, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                summary.last_error = Some("cancelled during retry backoff".to_string());
                                aborted = true;
                                self.apply(EngineEvent::Aborted);
                                break 'batches;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            if !all {
                break;
            }
        }

        if !aborted {
            self.apply(EngineEvent::Drained);
        }

        summary.remaining_pending = self.store.count_by_status().await?.pending;

        if cycle_failed {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.cfg.retry.max_consecutive_failures {
                self.enter_cooldown(failures);
            }
        } else {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }

        info!(
            synced = summary.synced,
            failed = summary.failed,
            batches = summary.batches,
            remaining = summary.remaining_pending,
            auth_failed = summary.auth_failed,
            "sync cycle finished"
        );
        Ok(summary)
    }

    fn enter_cooldown(&self, failures: u32) {
        let mut until = match self.cooldown_until.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *until = Some(Instant::now() + self.cfg.retry.failure_cooldown);
        warn!(
            failures,
            cooldown_secs = self.cfg.retry.failure_cooldown.as_secs(),
            "consecutive failure threshold reached; entering cooldown"
        );
        self.apply(EngineEvent::FailureThreshold);
    }

    /// Apply an FSM event. An illegal transition is an engine bug; it is
    /// logged and the state left untouched so the cycle can still finish.
    fn apply(&self, event: EngineEvent) {
        let mut fsm = match self.fsm.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = fsm.apply(event) {
            warn!(error = %e, "engine state machine rejected event");
            debug_assert!(false, "illegal engine transition: {e}");
        }
    }
}

/// One wire event per scan, in `local_id` order, timestamps through the
/// canonical serializer.
fn build_batch(scans: &[Scan]) -> BatchRequest {
    BatchRequest {
        events: scans
            .iter()
            .map(|s| BatchEvent {
                idempotency_key: s.idempotency_key.clone(),
                badge_id: s.badge_id.clone(),
                station_name: s.station_name.clone(),
                scanned_at: to_canonical(&s.scanned_at_utc),
                meta: EventMeta {
                    matched: s.matched,
                    local_id: s.local_id,
                },
            })
            .collect(),
    }
}
