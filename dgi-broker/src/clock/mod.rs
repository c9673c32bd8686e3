/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Corrected wall clock shared by every broker service.
//!
//! The [`ClockSynchronizer`] publishes a single offset into a [`SyncedClock`];
//! the phase scheduler reads it to align phase boundaries and the delivery
//! protocol reads it to stamp expiry times.
//!
//! ```text
//!  ClockSynchronizer ── set_offset() ──► SyncedClock ──► now()
//!                                            │            ├── PhaseScheduler (alignment)
//!                                            │            └── PeerConnection (expiry)
//!                                            └─ local_now() ── regression samples
//! ```

pub mod regression;
pub mod synchronizer;

pub use synchronizer::ClockSynchronizer;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

/// Wall clock plus a published correction.
///
/// Cloning shares the underlying offset.
#[derive(Debug, Clone, Default)]
pub struct SyncedClock {
    offset_us: Arc<AtomicI64>,
}

impl SyncedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uncorrected local time.
    pub fn local_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Local time plus the published correction.
    pub fn now(&self) -> DateTime<Utc> {
        self.local_now() + self.offset()
    }

    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::microseconds(self.offset_us.load(Ordering::Relaxed))
    }

    pub fn set_offset(&self, offset: chrono::Duration) {
        let us = offset.num_microseconds().unwrap_or(if offset < chrono::Duration::zero() {
            i64::MIN
        } else {
            i64::MAX
        });
        self.offset_us.store(us, Ordering::Relaxed);
    }
}

/// Converts a std duration, saturating at the chrono range.
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::microseconds(i64::try_from(duration.as_micros()).unwrap_or(i64::MAX))
}

/// Wire encoding of absolute timestamps (RFC 3339, UTC, microseconds).
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Splits an offset into whole seconds and non-negative microseconds.
pub fn split_offset(offset: chrono::Duration) -> (i64, i64) {
    let us = offset.num_microseconds().unwrap_or(0);
    (us.div_euclid(1_000_000), us.rem_euclid(1_000_000))
}

/// Inverse of [`split_offset`]. `None` when the total does not fit in `i64`
/// microseconds.
pub fn join_offset(secs: i64, fracs_us: i64) -> Option<chrono::Duration> {
    secs.checked_mul(1_000_000)?
        .checked_add(fracs_us)
        .map(chrono::Duration::microseconds)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
