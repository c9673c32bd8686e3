/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the phase scheduler.
//!
//! Every `schedule*` entry point returns [`ScheduleError`] instead of silently
//! dropping work. Callers treat a rejection as "this work will not run" and do
//! not retry.

use thiserror::Error;

use super::TimerHandle;

/// Rejection returned by [`PhaseScheduler`](super::PhaseScheduler) scheduling
/// calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// [`stop()`](super::PhaseScheduler::stop) has been requested; no new
    /// work or timer waits are accepted.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// The module was never passed to
    /// [`register_module()`](super::PhaseScheduler::register_module).
    #[error("module '{0}' is not registered with the scheduler")]
    UnknownModule(String),

    /// The handle was not produced by
    /// [`allocate_timer()`](super::PhaseScheduler::allocate_timer) on this
    /// scheduler.
    #[error("timer {0} was never allocated")]
    UnknownTimer(TimerHandle),
}
