//! Round arithmetic for the phase scheduler.
//!
//! A round is the concatenation of every registered module's phase in
//! registration order. Every node derives the position inside the round from
//! its corrected wall clock, so nodes whose clocks agree also agree on which
//! module is active:
//!
//! ```text
//!  epoch ms mod round ──────────────┐
//!                                   ▼
//!  |── gm (400) ──|── lb (200) ──|── sc (300) ──|
//!  0             400            600            900
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::ModulePhase;

/// Sum of all phase durations.
pub fn round_length(modules: &[ModulePhase]) -> Duration {
    modules.iter().map(|m| m.duration).sum()
}

/// Position of `now` inside a round of length `round`.
pub fn elapsed_in_round(now: DateTime<Utc>, round: Duration) -> Duration {
    let round_ms = i64::try_from(round.as_millis()).unwrap_or(i64::MAX);
    if round_ms == 0 {
        return Duration::ZERO;
    }
    let offset = now.timestamp_millis().rem_euclid(round_ms);
    Duration::from_millis(offset.unsigned_abs())
}

/// Finds the module that owns `elapsed` and the time left in its phase.
///
/// Returns `None` only for an empty module list. An `elapsed` beyond the end
/// of the round resolves to the last module with nothing remaining.
pub fn locate(modules: &[ModulePhase], elapsed: Duration) -> Option<(usize, Duration)> {
    let mut cumulative = Duration::ZERO;
    for (index, module) in modules.iter().enumerate() {
        cumulative += module.duration;
        if cumulative > elapsed {
            return Some((index, cumulative - elapsed));
        }
    }
    modules.len().checked_sub(1).map(|last| (last, Duration::ZERO))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
