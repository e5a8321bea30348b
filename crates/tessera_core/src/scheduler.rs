//! # Frame Scheduler
//!
//! Capped-cadence loop shared by the simulation and graphics threads.
//!
//! ## Lifecycle
//!
//! ```text
//! UNINITIALIZED ──init ok──> RUNNING ──stop flag──> STOPPING ──cleanup──> STOPPED
//!       │                                                                    ^
//!       └──────────────────────── init error / panic ────────────────────────┘
//! ```
//!
//! An `update` error or panic leaves RUNNING through STOPPING like a stop
//! request does, so `cleanup` always runs once `init` succeeded.
//!
//! ## Pacing
//!
//! With a target rate, each iteration gets a budget of `1 / target_hz`.
//! Leftover time is slept off coarsely, the last `spin_window` is spun for
//! precision. Without a target rate the loop runs flat out.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::command::panic_message;
use crate::config::SchedulerConfig;
use crate::error::{SyncError, SyncResult};

/// Scheduler lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SchedulerState {
    /// Created, `init` not run yet.
    Uninitialized = 0,
    /// Iterating.
    Running = 1,
    /// Stop observed, running `cleanup`.
    Stopping = 2,
    /// Finished.
    Stopped = 3,
}

impl SchedulerState {
    #[inline]
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Work performed once per scheduler iteration.
///
/// All hooks run on the scheduler's own thread.
pub trait TimeStepTask: Send {
    /// Runs once before the first iteration. An error or a panic stops the
    /// scheduler without running `cleanup`.
    ///
    /// # Errors
    ///
    /// Implementation defined; typically [`SyncError::ContextInit`].
    fn init(&mut self) -> SyncResult<()> {
        Ok(())
    }

    /// One iteration. `seconds` is the clamped time since the previous one.
    ///
    /// # Errors
    ///
    /// Any error is logged and stops the loop. A panic is caught and
    /// reported as [`SyncError::ThreadPanicked`]; `cleanup` still runs.
    fn update(&mut self, seconds: f32) -> SyncResult<()>;

    /// Runs once after the last iteration.
    fn cleanup(&mut self) {}
}

/// Waits until an iteration deadline.
pub trait FramePacer: Send {
    /// Returns no earlier than `deadline` (returns at once if it has passed).
    fn wait_until(&self, deadline: Instant);
}

/// Sleeps coarsely, then spins for the final `spin_window`.
#[derive(Clone, Copy, Debug)]
pub struct SleepSpinPacer {
    spin_window: Duration,
}

impl SleepSpinPacer {
    /// Creates a pacer that spins for the last `spin_window` before a deadline.
    #[must_use]
    pub const fn new(spin_window: Duration) -> Self {
        Self { spin_window }
    }
}

impl Default for SleepSpinPacer {
    fn default() -> Self {
        Self::new(Duration::from_micros(1000))
    }
}

impl FramePacer for SleepSpinPacer {
    fn wait_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline <= now {
            return;
        }

        // Sleep for most of the time
        let remaining = deadline - now;
        if remaining > self.spin_window {
            thread::sleep(remaining - self.spin_window);
        }

        // Spin-wait for precision
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// State shared between the loop and its controllers.
#[derive(Debug)]
struct Shared {
    name: String,
    state: AtomicU8,
    stop: AtomicBool,
    cycles: AtomicU64,
    overruns: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
        tracing::debug!("{}: {:?}", self.name, state);
    }

    /// A task hook that unwound ends the loop like an error would.
    fn panicked(&self, payload: &(dyn Any + Send)) -> SyncError {
        SyncError::ThreadPanicked {
            thread: self.name.clone(),
            message: panic_message(payload),
        }
    }
}

/// Cloneable remote control for a scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerControl {
    shared: Arc<Shared>,
}

impl SchedulerControl {
    /// Asks the loop to stop after the current iteration.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Returns whether a stop has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Completed iterations.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Iterations that exceeded their budget.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// Scheduler (and thread) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// A task bound to a cadence and a pacer.
///
/// ## Usage
///
/// ```rust,ignore
/// let handle = TimeStepThread::new(config.simulation.clone(), task).spawn()?;
/// handle.wait_running(Duration::from_secs(1))?;
/// // ...
/// handle.request_stop();
/// handle.join_timeout(Duration::from_secs(2))?;
/// ```
pub struct TimeStepThread<T, P = SleepSpinPacer> {
    config: SchedulerConfig,
    task: T,
    pacer: P,
    shared: Arc<Shared>,
}

impl<T: TimeStepTask> TimeStepThread<T> {
    /// Creates a scheduler paced by a [`SleepSpinPacer`] using the
    /// configured spin window.
    #[must_use]
    pub fn new(config: SchedulerConfig, task: T) -> Self {
        let pacer = SleepSpinPacer::new(config.spin_window());
        Self::with_pacer(config, task, pacer)
    }
}

impl<T: TimeStepTask, P: FramePacer> TimeStepThread<T, P> {
    /// Creates a scheduler with a custom pacer.
    #[must_use]
    pub fn with_pacer(config: SchedulerConfig, task: T, pacer: P) -> Self {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            state: AtomicU8::new(SchedulerState::Uninitialized as u8),
            stop: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        });
        Self {
            config,
            task,
            pacer,
            shared,
        }
    }

    /// Returns a control for stopping and observing this scheduler.
    #[must_use]
    pub fn control(&self) -> SchedulerControl {
        SchedulerControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the loop on the current thread until stopped.
    ///
    /// # Errors
    ///
    /// The task's `init` error, or the `update` error that stopped the loop.
    pub fn run(self) -> SyncResult<()> {
        self.run_loop(None)
    }

    /// Runs the loop on a new named thread.
    ///
    /// # Errors
    ///
    /// [`SyncError::ThreadSpawn`] if the OS refuses the thread.
    pub fn spawn(self) -> SyncResult<SchedulerHandle>
    where
        T: 'static,
        P: 'static,
    {
        let control = self.control();
        let (ready_tx, ready_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.run_loop(Some(ready_tx)))
            .map_err(|e| SyncError::ThreadSpawn(format!("{}: {e}", control.name())))?;

        Ok(SchedulerHandle {
            control,
            ready: ready_rx,
            thread: Some(thread),
        })
    }

    fn run_loop(mut self, ready: Option<Sender<SyncResult<()>>>) -> SyncResult<()> {
        let shared = Arc::clone(&self.shared);

        let init = panic::catch_unwind(AssertUnwindSafe(|| self.task.init()))
            .unwrap_or_else(|p| Err(shared.panicked(p.as_ref())));
        if let Err(e) = init {
            tracing::error!("{}: init failed: {}", shared.name, e);
            shared.set_state(SchedulerState::Stopped);
            if let Some(ready) = ready {
                // Nobody waiting is fine
                let _ = ready.send(Err(e.clone()));
            }
            return Err(e);
        }
        shared.set_state(SchedulerState::Running);
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }
        tracing::info!(
            "{} running (target {:?} Hz)",
            shared.name,
            self.config.target_hz
        );

        let min_cycle = self.config.min_cycle();
        let max_delta = self.config.max_delta_seconds;
        let mut last = Instant::now();
        let mut outcome = Ok(());

        while !shared.stop.load(Ordering::Acquire) {
            let start = Instant::now();
            let seconds = start.duration_since(last).as_secs_f32().min(max_delta);
            last = start;

            let update = panic::catch_unwind(AssertUnwindSafe(|| self.task.update(seconds)))
                .unwrap_or_else(|p| Err(shared.panicked(p.as_ref())));
            if let Err(e) = update {
                tracing::error!("{}: update failed, stopping: {}", shared.name, e);
                outcome = Err(e);
                break;
            }
            shared.cycles.fetch_add(1, Ordering::AcqRel);

            if let Some(budget) = min_cycle {
                let deadline = start + budget;
                if Instant::now() > deadline {
                    shared.overruns.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.pacer.wait_until(deadline);
                }
            }
        }

        shared.set_state(SchedulerState::Stopping);
        self.task.cleanup();
        shared.set_state(SchedulerState::Stopped);
        tracing::info!(
            "{} stopped after {} cycles ({} over budget)",
            shared.name,
            shared.cycles.load(Ordering::Acquire),
            shared.overruns.load(Ordering::Relaxed)
        );
        outcome
    }
}

impl<T, P> fmt::Debug for TimeStepThread<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeStepThread")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Owner's handle to a spawned scheduler thread.
///
/// Dropping the handle requests a stop but does not join.
#[derive(Debug)]
pub struct SchedulerHandle {
    control: SchedulerControl,
    ready: Receiver<SyncResult<()>>,
    thread: Option<JoinHandle<SyncResult<()>>>,
}

impl SchedulerHandle {
    /// Asks the loop to stop after the current iteration.
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.control.state()
    }

    /// Completed iterations.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.control.cycles()
    }

    /// A cloneable control for the same scheduler.
    #[must_use]
    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    /// Returns true once the thread has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the task's `init` to complete.
    ///
    /// Meaningful once per handle.
    ///
    /// # Errors
    ///
    /// The `init` error, [`SyncError::Timeout`] if init is still running,
    /// or [`SyncError::Disconnected`] if the thread died without reporting.
    pub fn wait_running(&self, timeout: Duration) -> SyncResult<()> {
        match self.ready.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SyncError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::Disconnected),
        }
    }

    /// Joins the thread, giving up after `timeout`.
    ///
    /// On timeout the handle keeps the thread and the call may be retried.
    ///
    /// # Errors
    ///
    /// [`SyncError::JoinTimeout`], [`SyncError::ThreadPanicked`], or the
    /// error the loop itself returned.
    pub fn join_timeout(&mut self, timeout: Duration) -> SyncResult<()> {
        let deadline = Instant::now() + timeout;
        let Some(thread) = self.thread.as_ref() else {
            return Ok(());
        };
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                return Err(SyncError::JoinTimeout {
                    thread: self.control.name().to_owned(),
                });
            }
            thread::sleep(Duration::from_millis(1));
        }

        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(payload)) => Err(SyncError::ThreadPanicked {
                thread: self.control.name().to_owned(),
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.control.request_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<&'static str>>>,
        deltas: Arc<Mutex<Vec<f32>>>,
        fail_init: bool,
        fail_at: Option<usize>,
        panic_at: Option<usize>,
        updates: usize,
    }

    impl TimeStepTask for Recorder {
        fn init(&mut self) -> SyncResult<()> {
            self.log.lock().unwrap().push("init");
            if self.fail_init {
                return Err(SyncError::ContextInit("no device".into()));
            }
            Ok(())
        }

        fn update(&mut self, seconds: f32) -> SyncResult<()> {
            self.updates += 1;
            self.deltas.lock().unwrap().push(seconds);
            if self.fail_at == Some(self.updates) {
                return Err(SyncError::CommandFailed("update".into()));
            }
            if self.panic_at == Some(self.updates) {
                panic!("scene graph corrupted");
            }
            Ok(())
        }

        fn cleanup(&mut self) {
            self.log.lock().unwrap().push("cleanup");
        }
    }

    fn config(hz: Option<u32>) -> SchedulerConfig {
        SchedulerConfig::named("test-scheduler", hz)
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            SchedulerState::Uninitialized,
            SchedulerState::Running,
            SchedulerState::Stopping,
            SchedulerState::Stopped,
        ] {
            assert_eq!(SchedulerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_pacer_waits_until_deadline() {
        let pacer = SleepSpinPacer::new(Duration::from_micros(500));
        let start = Instant::now();
        let deadline = start + Duration::from_millis(3);
        pacer.wait_until(deadline);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_pacer_past_deadline_returns() {
        let pacer = SleepSpinPacer::default();
        let start = Instant::now();
        pacer.wait_until(start);
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn test_init_failure_stops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Recorder {
            log: Arc::clone(&log),
            fail_init: true,
            ..Recorder::default()
        };
        let scheduler = TimeStepThread::new(config(None), task);
        let control = scheduler.control();

        let result = scheduler.run();
        assert_eq!(result, Err(SyncError::ContextInit("no device".into())));
        assert_eq!(control.state(), SchedulerState::Stopped);
        assert_eq!(control.cycles(), 0);
        // No cleanup when init never succeeded
        assert_eq!(*log.lock().unwrap(), vec!["init"]);
    }

    #[test]
    fn test_update_failure_stops_after_cleanup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Recorder {
            log: Arc::clone(&log),
            fail_at: Some(3),
            ..Recorder::default()
        };
        let scheduler = TimeStepThread::new(config(None), task);
        let control = scheduler.control();

        assert!(scheduler.run().is_err());
        assert_eq!(control.cycles(), 2);
        assert_eq!(control.state(), SchedulerState::Stopped);
        assert_eq!(*log.lock().unwrap(), vec!["init", "cleanup"]);
    }

    #[test]
    fn test_update_panic_stops_after_cleanup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Recorder {
            log: Arc::clone(&log),
            panic_at: Some(2),
            ..Recorder::default()
        };
        let scheduler = TimeStepThread::new(config(None), task);
        let control = scheduler.control();

        assert_eq!(
            scheduler.run(),
            Err(SyncError::ThreadPanicked {
                thread: "test-scheduler".into(),
                message: "scene graph corrupted".into(),
            })
        );
        assert_eq!(control.cycles(), 1);
        assert_eq!(control.state(), SchedulerState::Stopped);
        assert_eq!(*log.lock().unwrap(), vec!["init", "cleanup"]);
    }

    #[test]
    fn test_spawned_update_panic_is_joinable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Recorder {
            log: Arc::clone(&log),
            panic_at: Some(5),
            ..Recorder::default()
        };
        let mut handle = TimeStepThread::new(config(Some(1000)), task).spawn().unwrap();
        handle.wait_running(Duration::from_secs(5)).unwrap();

        // The loop ends on its own; no stop request needed
        let result = handle.join_timeout(Duration::from_secs(5));
        assert!(matches!(result, Err(SyncError::ThreadPanicked { .. })));
        assert_eq!(handle.state(), SchedulerState::Stopped);
        assert_eq!(*log.lock().unwrap(), vec!["init", "cleanup"]);
    }

    #[test]
    fn test_init_panic_is_reported() {
        struct Broken;

        impl TimeStepTask for Broken {
            fn init(&mut self) -> SyncResult<()> {
                panic!("driver crashed");
            }

            fn update(&mut self, _seconds: f32) -> SyncResult<()> {
                Ok(())
            }
        }

        let mut handle = TimeStepThread::new(config(None), Broken).spawn().unwrap();
        assert_eq!(
            handle.wait_running(Duration::from_secs(5)),
            Err(SyncError::ThreadPanicked {
                thread: "test-scheduler".into(),
                message: "driver crashed".into(),
            })
        );
        assert!(handle.join_timeout(Duration::from_secs(5)).is_err());
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_stop_exits_within_one_cycle() {
        let mut handle = TimeStepThread::new(config(Some(20)), Recorder::default())
            .spawn()
            .unwrap();
        handle.wait_running(Duration::from_secs(5)).unwrap();
        while handle.cycles() < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        // Stop flag is polled once per iteration: at most the rest of the
        // current 50 ms budget plus join polling
        let min_cycle = Duration::from_millis(50);
        handle.request_stop();
        assert_eq!(handle.join_timeout(min_cycle * 2), Ok(()));
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_spawn_and_stop() {
        let mut handle = TimeStepThread::new(config(Some(1000)), Recorder::default())
            .spawn()
            .unwrap();
        handle.wait_running(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.state(), SchedulerState::Running);

        while handle.cycles() < 5 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.request_stop();
        handle.join_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.state(), SchedulerState::Stopped);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_spawn_reports_init_error() {
        let task = Recorder {
            fail_init: true,
            ..Recorder::default()
        };
        let mut handle = TimeStepThread::new(config(None), task).spawn().unwrap();
        assert_eq!(
            handle.wait_running(Duration::from_secs(5)),
            Err(SyncError::ContextInit("no device".into()))
        );
        assert!(handle.join_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_delta_is_clamped() {
        struct Slow {
            deltas: Arc<Mutex<Vec<f32>>>,
            control: Option<SchedulerControl>,
        }

        impl TimeStepTask for Slow {
            fn update(&mut self, seconds: f32) -> SyncResult<()> {
                self.deltas.lock().unwrap().push(seconds);
                thread::sleep(Duration::from_millis(20));
                if self.deltas.lock().unwrap().len() >= 3 {
                    if let Some(control) = &self.control {
                        control.request_stop();
                    }
                }
                Ok(())
            }
        }

        let deltas = Arc::new(Mutex::new(Vec::new()));
        let mut cfg = config(None);
        cfg.max_delta_seconds = 0.005;
        let mut scheduler = TimeStepThread::new(
            cfg,
            Slow {
                deltas: Arc::clone(&deltas),
                control: None,
            },
        );
        scheduler.task.control = Some(scheduler.control());
        scheduler.run().unwrap();

        let deltas = deltas.lock().unwrap();
        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|&d| d <= 0.005));
    }

    #[test]
    fn test_join_timeout_on_stuck_thread() {
        struct Stuck {
            entered: Arc<AtomicBool>,
            release: Arc<AtomicBool>,
        }

        impl TimeStepTask for Stuck {
            fn update(&mut self, _seconds: f32) -> SyncResult<()> {
                self.entered.store(true, Ordering::Release);
                while !self.release.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
        }

        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let task = Stuck {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        };
        let mut handle = TimeStepThread::new(config(None), task).spawn().unwrap();
        while !entered.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }

        handle.request_stop();
        assert_eq!(
            handle.join_timeout(Duration::from_millis(10)),
            Err(SyncError::JoinTimeout {
                thread: "test-scheduler".into()
            })
        );

        // Retry once the iteration can finish
        release.store(true, Ordering::Release);
        handle.join_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.cycles(), 1);
    }
}
