//! Re-armable one-shot alarm.
//!
//! An [`Alarm`] owns at most one pending wait. Arming it again, cancelling it,
//! or firing it early resolves the pending wait; the callback bound to that
//! wait always runs exactly once and receives a [`TimerStatus`] telling it
//! whether the deadline was reached or the wait was aborted.
//!
//! ```text
//!  arm(After(d), cb)  ──► sleep(d) ─────────────► cb(Fired)
//!        │
//!        └── arm / cancel before d ─────────────► cb(Aborted)
//!
//!  arm(Until, cb)     ──► fire_now() ───────────► cb(Fired)
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::sync::lock;

/// Outcome delivered to an alarm callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// The deadline passed, or the wait was released by [`Alarm::fire_now`].
    Fired,
    /// The wait was superseded or cancelled. Not an error.
    Aborted,
}

/// How long an armed alarm waits before firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    After(Duration),
    /// Wait until [`Alarm::fire_now`] or cancellation.
    Until,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    pending: Option<oneshot::Sender<TimerStatus>>,
}

/// A one-shot timer that can be re-armed any number of times.
///
/// Arming spawns onto the current tokio runtime, so it must be called from
/// within one.
#[derive(Debug, Clone, Default)]
pub struct Alarm {
    slot: Arc<Mutex<Slot>>,
}

impl Alarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the alarm, aborting any wait that is still pending.
    pub fn arm<F>(&self, deadline: Deadline, callback: F)
    where
        F: FnOnce(TimerStatus) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut slot = lock(&self.slot);
            slot.generation = slot.generation.wrapping_add(1);
            if let Some(previous) = slot.pending.replace(tx) {
                let _ = previous.send(TimerStatus::Aborted);
            }
            slot.generation
        };

        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let status = match deadline {
                Deadline::After(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => TimerStatus::Fired,
                        signal = rx => signal.unwrap_or(TimerStatus::Aborted),
                    }
                }
                Deadline::Until => rx.await.unwrap_or(TimerStatus::Aborted),
            };
            {
                let mut slot = lock(&slot);
                if slot.generation == generation {
                    slot.pending = None;
                }
            }
            callback(status);
        });
    }

    /// Releases the pending wait as [`TimerStatus::Fired`].
    ///
    /// Returns `false` when nothing was pending.
    pub fn fire_now(&self) -> bool {
        self.resolve(TimerStatus::Fired)
    }

    /// Releases the pending wait as [`TimerStatus::Aborted`].
    pub fn cancel(&self) -> bool {
        self.resolve(TimerStatus::Aborted)
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    fn resolve(&self, status: TimerStatus) -> bool {
        let pending = lock(&self.slot).pending.take();
        match pending {
            Some(tx) => tx.send(status).is_ok(),
            None => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
