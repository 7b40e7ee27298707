//! Sync engine state machine.
//!
//! # Design
//!
//! Explicit state machine for the engine's cycle lifecycle. Every event is
//! applied via [`EngineFsm::apply`], which enforces legal transitions only;
//! an illegal event returns [`TransitionError`], which the engine treats as
//! an internal bug (logged loudly, state untouched).
//!
//! # State diagram
//!
//! ```text
//!             Start              Reachable
//!   Idle ───────────► Probing ─────────────► Uploading ──┐
//!    ▲                   │                      │  ▲      │ BatchOk
//!    │    Unreachable    │            Drained / │  └──────┘
//!    ├───────────────────┘            Aborted   │
//!    └──────────────────────────────────────────┘
//!
//!   any live state + FailureThreshold ──► Cooldown ── CooldownExpired ──► Idle
//! ```

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

/// All states the sync engine can occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// No cycle in flight.
    Idle,
    /// Reachability probe in progress at the top of a cycle.
    Probing,
    /// Draining pending batches.
    Uploading,
    /// Too many consecutive cycle failures; the scheduler must not invoke.
    Cooldown,
}

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// Events that drive engine transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A cycle acquired the single-flight lock.
    Start,
    /// The pre-cycle probe succeeded.
    Reachable,
    /// The pre-cycle probe failed; the cycle ends without work.
    Unreachable,
    /// One batch committed its lifecycle transitions; more remain.
    BatchOk,
    /// No pending scans remain; the cycle completed.
    Drained,
    /// The cycle ended early (auth halt, transient exhaustion, cancel).
    Aborted,
    /// Consecutive cycle failures reached the configured threshold.
    FailureThreshold,
    /// The cooldown timer elapsed.
    CooldownExpired,
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// An event that cannot legally be applied in the current state. Indicates
/// an engine bug, not an operational condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionError {
    pub from: EngineState,
    pub event: EngineEvent,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal engine transition: {:?} + {:?}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// EngineFsm
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EngineFsm {
    state: EngineState,
}

impl Default for EngineFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFsm {
    pub fn new() -> Self {
        Self {
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Apply an event.
    ///
    /// # Errors
    /// Returns [`TransitionError`] for illegal transitions; state is left
    /// unchanged.
    pub fn apply(&mut self, event: EngineEvent) -> Result<EngineState, TransitionError> {
        use EngineEvent::*;
        use EngineState::*;

        let next = match (self.state, event) {
            (Idle, Start) => Probing,
            (Probing, Reachable) => Uploading,
            (Probing, Unreachable) => Idle,
            (Uploading, BatchOk) => Uploading,
            (Uploading, Drained) => Idle,
            (Uploading, Aborted) => Idle,
            // The failure threshold can trip at the end of any live cycle.
            (Idle | Probing | Uploading, FailureThreshold) => Cooldown,
            (Cooldown, CooldownExpired) => Idle,
            (state, ev) => {
                return Err(TransitionError {
                    from: state,
                    event: ev,
                })
            }
        };
        self.state = next;
        Ok(next)
    }
}
