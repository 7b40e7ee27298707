//! Exponential backoff with full jitter.
//!
//! The wait before retry attempt `k` (1-based count of completed attempts)
//! lies in `[base · 2^(k−1), 2 · base · 2^(k−1))`. The jitter unit is a
//! caller-supplied value in `[0, 1)` so the computation itself stays
//! deterministic and testable; the engine feeds it from `rand`.

use std::time::Duration;

/// Deterministic core: `base · 2^(k−1) · (1 + unit)`.
///
/// `attempt` is the number of the attempt that just failed (1-based);
/// `unit` must be in `[0, 1)`.
pub fn backoff_delay(base: Duration, attempt: u32, unit: f64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let floor = base.as_secs_f64() * f64::from(1u32 << exp);
    Duration::from_secs_f64(floor * (1.0 + unit.clamp(0.0, 1.0 - f64::EPSILON)))
}

/// Jittered delay as the engine uses it.
pub fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    backoff_delay(base, attempt, rand::thread_rng().gen_range(0.0..1.0))
}
