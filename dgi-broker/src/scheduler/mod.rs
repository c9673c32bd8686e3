//! Phase scheduler for the DGI broker.
//!
//! [`PhaseScheduler`] gives every registered module a bounded, repeating
//! time slice (a *phase*) and a private FIFO task queue. A single worker
//! drains the active module's queue one task at a time, so no two tasks ever
//! run concurrently and a module only runs inside its own phase, except for
//! timer tasks that fire between phase boundaries and wait in the owning
//! module's queue.
//!
//! # Phase advance
//!
//! The phase alarm re-arms itself. When more than `alignment_duration` has
//! passed since the last alignment, the active phase is snapped to the
//! position the corrected clock dictates (see [`phase`]); otherwise the
//! scheduler steps round-robin to the next module for a full phase.
//!
//! | Call | Lock held | Runs tasks |
//! |---|---|---|
//! | `register_module` | bookkeeping | no |
//! | `schedule` / `schedule_timer` | bookkeeping | no (wakes the worker) |
//! | worker step | pop only | yes, outside the lock |
//!
//! # Example
//! ```rust,ignore
//! let scheduler = PhaseScheduler::new(clock, Duration::from_millis(250));
//! scheduler.register_module("gm", Duration::from_millis(400));
//! let timer = scheduler.allocate_timer("gm");
//! scheduler.schedule_timer(timer, Wait::NextPhase, |status| { /* ... */ })?;
//! scheduler.schedule("gm", || { /* ... */ }, true)?;
//! ```

pub mod alarm;
pub mod error;
pub mod phase;

pub use alarm::{Alarm, Deadline, TimerStatus};
pub use error::ScheduleError;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::{to_chrono, SyncedClock};
use crate::sync::lock;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default interval between phase re-alignments against the corrected clock.
pub const ALIGNMENT_DURATION: Duration = Duration::from_millis(250);

/// Shortest phase a module can be given.
const MIN_PHASE: Duration = Duration::from_millis(1);

// ── Public types ──────────────────────────────────────────────────────────────

/// Name of a schedulable module (`"gm"`, `"lb"`, `"sc"`, ...).
pub type ModuleId = String;

/// A queued unit of module work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a reusable timer owned by one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u32);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How long a scheduled timer waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    After(Duration),
    /// Fire when the owning module's current phase ends.
    NextPhase,
}

/// One entry of the round: a module and its phase budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePhase {
    pub module: ModuleId,
    pub duration: Duration,
}

// ── Internal state ────────────────────────────────────────────────────────────

struct TimerEntry {
    module: ModuleId,
    alarm: Alarm,
    next_phase: bool,
}

#[derive(Default)]
struct SchedulerState {
    modules: Vec<ModulePhase>,
    ready: HashMap<ModuleId, VecDeque<Task>>,
    timers: HashMap<TimerHandle, TimerEntry>,
    next_timer: u32,
    phase: usize,
    phase_deadline: Option<Instant>,
    last_alignment: Option<DateTime<Utc>>,
    busy: bool,
}

impl SchedulerState {
    fn is_registered(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m.module == module)
    }

    fn active(&self) -> Option<&ModuleId> {
        self.phase_deadline?;
        self.modules.get(self.phase).map(|m| &m.module)
    }

    fn active_has_work(&self) -> bool {
        self.active()
            .and_then(|m| self.ready.get(m))
            .is_some_and(|q| !q.is_empty())
    }

    fn pop_active(&mut self) -> Option<Task> {
        self.phase_deadline?;
        let module = &self.modules.get(self.phase)?.module;
        self.ready.get_mut(module)?.pop_front()
    }

    /// Pops the oldest task of the first module (in round order) with work.
    fn pop_any(&mut self) -> Option<Task> {
        let modules = &self.modules;
        let ready = &mut self.ready;
        modules
            .iter()
            .find_map(|m| ready.get_mut(&m.module).and_then(VecDeque::pop_front))
    }
}

enum DrainStep {
    Run(Task),
    Wait,
    Done,
}

// ── PhaseScheduler ────────────────────────────────────────────────────────────

/// Cooperative round-robin scheduler shared by every broker module.
///
/// Constructed once by the process entry point and passed around as
/// `Arc<PhaseScheduler>`. Every method must be called from inside a tokio
/// runtime because timers and the worker are spawned onto it.
pub struct PhaseScheduler {
    state: Mutex<SchedulerState>,
    phase_alarm: Alarm,
    clock: SyncedClock,
    alignment: Duration,
    stopping: AtomicBool,
    shutdown: Notify,
}

impl PhaseScheduler {
    pub fn new(clock: SyncedClock, alignment: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState::default()),
            phase_alarm: Alarm::new(),
            clock,
            alignment,
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Adds `module` to the end of the round with a budget of `phase`.
    ///
    /// Registering an existing module is a no-op. The first registration
    /// starts the phase alarm.
    pub fn register_module(self: &Arc<Self>, module: impl Into<ModuleId>, phase: Duration) {
        let module = module.into();
        let phase = phase.max(MIN_PHASE);
        let first = {
            let mut st = lock(&self.state);
            if st.is_registered(&module) {
                debug!(module = %module, "module already registered");
                return;
            }
            st.modules.push(ModulePhase {
                module: module.clone(),
                duration: phase,
            });
            st.ready.entry(module.clone()).or_default();
            st.modules.len() == 1
        };

        info!(
            module = %module,
            phase_ms = phase.as_millis() as u64,
            "module registered"
        );

        if first {
            self.change_phase(TimerStatus::Fired);
        }
    }

    pub fn is_module_registered(&self, module: &str) -> bool {
        lock(&self.state).is_registered(module)
    }

    /// Snapshot of the round in registration order.
    pub fn modules(&self) -> Vec<ModulePhase> {
        lock(&self.state).modules.clone()
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Returns a fresh timer bound to `module`.
    pub fn allocate_timer(&self, module: &str) -> TimerHandle {
        let mut st = lock(&self.state);
        if !st.is_registered(module) {
            warn!(module = %module, "timer allocated for an unregistered module");
        }
        let handle = TimerHandle(st.next_timer);
        st.next_timer = st.next_timer.wrapping_add(1);
        st.timers.insert(
            handle,
            TimerEntry {
                module: module.to_string(),
                alarm: Alarm::new(),
                next_phase: false,
            },
        );
        debug!(module = %module, timer = %handle, "timer allocated");
        handle
    }

    /// Arms `handle`; when it resolves, `task(status)` is queued on the
    /// timer's module.
    ///
    /// A wait that is still pending is aborted and its task runs with
    /// [`TimerStatus::Aborted`].
    pub fn schedule_timer<F>(
        self: &Arc<Self>,
        handle: TimerHandle,
        wait: Wait,
        task: F,
    ) -> Result<(), ScheduleError>
    where
        F: FnOnce(TimerStatus) + Send + 'static,
    {
        if self.is_stopping() {
            return Err(ScheduleError::ShuttingDown);
        }

        let mut st = lock(&self.state);
        let entry = st
            .timers
            .get_mut(&handle)
            .ok_or(ScheduleError::UnknownTimer(handle))?;

        let deadline = match wait {
            Wait::After(delay) => Deadline::After(delay),
            Wait::NextPhase => Deadline::Until,
        };
        entry.next_phase = wait == Wait::NextPhase;

        let module = entry.module.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        entry.alarm.arm(deadline, move |status| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.enqueue_fired(module, Box::new(move || task(status)));
            }
        });
        Ok(())
    }

    /// Aborts the pending wait on `handle`, if any.
    pub fn cancel_timer(&self, handle: TimerHandle) -> Result<(), ScheduleError> {
        let mut st = lock(&self.state);
        let entry = st
            .timers
            .get_mut(&handle)
            .ok_or(ScheduleError::UnknownTimer(handle))?;
        entry.next_phase = false;
        entry.alarm.cancel();
        Ok(())
    }

    fn enqueue_fired(self: &Arc<Self>, module: ModuleId, task: Task) {
        lock(&self.state)
            .ready
            .entry(module)
            .or_default()
            .push_back(task);
        self.start_worker();
    }

    // ── Task queues ───────────────────────────────────────────────────────────

    /// Appends `task` to `module`'s queue, waking the worker when
    /// `start_worker` is set.
    pub fn schedule<F>(
        self: &Arc<Self>,
        module: &str,
        task: F,
        start_worker: bool,
    ) -> Result<(), ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopping() {
            return Err(ScheduleError::ShuttingDown);
        }
        {
            let mut st = lock(&self.state);
            if !st.is_registered(module) {
                return Err(ScheduleError::UnknownModule(module.to_string()));
            }
            st.ready
                .entry(module.to_string())
                .or_default()
                .push_back(Box::new(task));
        }
        if start_worker {
            self.start_worker();
        }
        Ok(())
    }

    /// Number of tasks waiting in `module`'s queue.
    pub fn queued(&self, module: &str) -> usize {
        lock(&self.state).ready.get(module).map_or(0, VecDeque::len)
    }

    // ── Phase state ───────────────────────────────────────────────────────────

    /// Time left in the active module's phase.
    pub fn time_remaining(&self) -> Duration {
        lock(&self.state)
            .phase_deadline
            .map_or(Duration::ZERO, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            })
    }

    pub fn active_module(&self) -> Option<ModuleId> {
        lock(&self.state).active().cloned()
    }

    fn change_phase(self: &Arc<Self>, status: TimerStatus) {
        if status == TimerStatus::Aborted || self.is_stopping() {
            return;
        }

        let now = self.clock.now();
        let (wait, active, ended) = {
            let mut st = lock(&self.state);
            if st.modules.is_empty() {
                return;
            }

            let previous = st.active().cloned();
            let realign = st
                .last_alignment
                .map_or(true, |last| now - last > to_chrono(self.alignment));

            let wait = if realign {
                let round = phase::round_length(&st.modules);
                let elapsed = phase::elapsed_in_round(now, round);
                let (index, remaining) =
                    phase::locate(&st.modules, elapsed).unwrap_or((0, MIN_PHASE));
                st.phase = index;
                st.last_alignment = Some(now);
                remaining.max(MIN_PHASE)
            } else {
                st.phase = (st.phase + 1) % st.modules.len();
                st.modules[st.phase].duration
            };
            st.phase_deadline = Some(Instant::now() + wait);

            let ended: Vec<Alarm> = match &previous {
                Some(module) => st
                    .timers
                    .values_mut()
                    .filter(|t| t.next_phase && &t.module == module)
                    .map(|t| {
                        t.next_phase = false;
                        t.alarm.clone()
                    })
                    .collect(),
                None => Vec::new(),
            };

            (wait, st.modules[st.phase].module.clone(), ended)
        };

        for alarm in ended {
            alarm.fire_now();
        }

        debug!(
            module = %active,
            phase_ms = wait.as_millis() as u64,
            "phase change"
        );

        let weak = Arc::downgrade(self);
        self.phase_alarm.arm(Deadline::After(wait), move |status| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.change_phase(status);
            }
        });

        self.start_worker();
    }

    // ── Worker ────────────────────────────────────────────────────────────────

    fn start_worker(self: &Arc<Self>) {
        {
            let mut st = lock(&self.state);
            if st.busy || !st.active_has_work() {
                return;
            }
            st.busy = true;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.work() });
    }

    /// Runs one task of the active module, then re-posts itself.
    fn work(self: Arc<Self>) {
        let task = {
            let mut st = lock(&self.state);
            match st.pop_active() {
                Some(task) => task,
                None => {
                    st.busy = false;
                    return;
                }
            }
        };

        run_task(task);

        tokio::spawn(async move { self.work() });
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Waits until [`stop()`](Self::stop) is requested, then drains every
    /// task that was already queued.
    pub async fn run(&self) {
        info!("phase scheduler running");
        self.shutdown.notified().await;

        let drained = self.drain().await;
        info!(drained, "phase scheduler stopped");
    }

    /// Requests shutdown. Safe to call from any context and more than once.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("phase scheduler stop requested");
        self.phase_alarm.cancel();
        self.shutdown.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let step = {
                let mut st = lock(&self.state);
                if st.busy {
                    DrainStep::Wait
                } else {
                    match st.pop_any() {
                        Some(task) => {
                            st.busy = true;
                            DrainStep::Run(task)
                        }
                        None => DrainStep::Done,
                    }
                }
            };

            match step {
                DrainStep::Run(task) => {
                    run_task(task);
                    lock(&self.state).busy = false;
                    drained += 1;
                }
                DrainStep::Wait => tokio::time::sleep(MIN_PHASE).await,
                DrainStep::Done => return drained,
            }
        }
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("scheduled task panicked");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn scheduler() -> Arc<PhaseScheduler> {
        PhaseScheduler::new(SyncedClock::new(), ALIGNMENT_DURATION)
    }

    // ── Registration ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn register_is_idempotent() {
        let s = scheduler();
        s.register_module("gm", Duration::from_millis(100));
        s.register_module("lb", Duration::from_millis(100));
        s.register_module("gm", Duration::from_millis(999));

        let modules = s.modules();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].module, "gm");
        assert_eq!(modules[0].duration, Duration::from_millis(100));
        assert!(s.is_module_registered("lb"));
        assert!(!s.is_module_registered("sc"));
    }

    #[tokio::test]
    async fn first_registration_starts_the_round() {
        let s = scheduler();
        assert_eq!(s.active_module(), None);
        assert_eq!(s.time_remaining(), Duration::ZERO);

        s.register_module("gm", Duration::from_millis(500));
        assert_eq!(s.active_module().as_deref(), Some("gm"));
        assert!(s.time_remaining() <= Duration::from_millis(500));
    }

    // ── Schedule ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn schedule_rejects_unknown_module() {
        let s = scheduler();
        let err = s.schedule("ghost", || {}, true).unwrap_err();
        assert_eq!(err, ScheduleError::UnknownModule("ghost".into()));
    }

    #[tokio::test]
    async fn schedule_rejects_after_stop() {
        let s = scheduler();
        s.register_module("gm", Duration::from_millis(100));
        let timer = s.allocate_timer("gm");
        s.stop();

        assert_eq!(
            s.schedule("gm", || {}, true).unwrap_err(),
            ScheduleError::ShuttingDown
        );
        assert_eq!(
            s.schedule_timer(timer, Wait::After(Duration::ZERO), |_| {})
                .unwrap_err(),
            ScheduleError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn unknown_timer_is_rejected() {
        let s = scheduler();
        let err = s
            .schedule_timer(TimerHandle(42), Wait::NextPhase, |_| {})
            .unwrap_err();
        assert_eq!(err, ScheduleError::UnknownTimer(TimerHandle(42)));
    }

    #[tokio::test]
    async fn tasks_run_in_fifo_order() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            let tx = tx.clone();
            s.schedule("gm", move || tx.send(i).unwrap(), true).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn deferred_start_waits_for_worker() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        s.schedule("gm", move || { r.fetch_add(1, Ordering::SeqCst); }, false)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(s.queued("gm"), 1);

        s.schedule("gm", || {}, true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_task_does_not_wedge_worker() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.schedule("gm", || panic!("boom"), true).unwrap();
        s.schedule("gm", move || tx.send("after").unwrap(), true).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "after");
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn timer_task_runs_in_module_queue() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        let timer = s.allocate_timer("gm");
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.schedule_timer(timer, Wait::After(Duration::from_millis(10)), move |st| {
            tx.send(st).unwrap()
        })
        .unwrap();
        assert_eq!(rx.recv().await.unwrap(), TimerStatus::Fired);
    }

    #[tokio::test]
    async fn rescheduling_a_timer_aborts_the_old_wait() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        let timer = s.allocate_timer("gm");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        s.schedule_timer(timer, Wait::After(Duration::from_secs(30)), move |st| {
            first.send(("first", st)).unwrap()
        })
        .unwrap();
        s.schedule_timer(timer, Wait::After(Duration::from_millis(5)), move |st| {
            tx.send(("second", st)).unwrap()
        })
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), ("first", TimerStatus::Aborted));
        assert_eq!(rx.recv().await.unwrap(), ("second", TimerStatus::Fired));
    }

    #[tokio::test]
    async fn cancel_timer_delivers_aborted() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        let timer = s.allocate_timer("gm");
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.schedule_timer(timer, Wait::NextPhase, move |st| tx.send(st).unwrap())
            .unwrap();
        s.cancel_timer(timer).unwrap();
        assert_eq!(rx.recv().await.unwrap(), TimerStatus::Aborted);
    }

    #[tokio::test]
    async fn next_phase_timer_fires_when_phase_ends() {
        let s = scheduler();
        s.register_module("gm", Duration::from_millis(20));
        s.register_module("lb", Duration::from_millis(20));
        let timer = s.allocate_timer("gm");
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.schedule_timer(timer, Wait::NextPhase, move |st| tx.send(st).unwrap())
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("next-phase timer never fired")
            .unwrap();
        assert_eq!(status, TimerStatus::Fired);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_drains_queued_work_after_stop() {
        let s = scheduler();
        s.register_module("gm", Duration::from_secs(60));
        s.register_module("lb", Duration::from_secs(60));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let r = Arc::clone(&ran);
            s.schedule("lb", move || { r.fetch_add(1, Ordering::SeqCst); }, false)
                .unwrap();
        }

        let runner = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.run().await })
        };
        s.stop();
        s.stop();
        runner.await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(s.is_stopping());
    }
}
