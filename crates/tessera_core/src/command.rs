//! # Graphics Command Queue
//!
//! The only sanctioned way for a non-graphics thread to touch the native
//! graphics context.
//!
//! ## Architecture
//!
//! ```text
//!   Asset loader ──┐
//!   Event handler ─┼──> [Bounded MPSC channel] ──drain──> Graphics thread
//!   Simulation ────┘         (FIFO)                    (single consumer)
//!        ^                                                   │
//!        └──────────── CommandFuture<T> <── result ──────────┘
//! ```
//!
//! Every submitted item carries its own one-shot result channel. A failing
//! item (panic or `Err`) is logged at the drain site and delivered through
//! that item's future only. The drain loop never stops because of it.
//!
//! ## Reentrancy
//!
//! If the caller already IS the graphics thread, work runs inline. Queuing
//! it and then blocking on the result would deadlock the only consumer.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;

use crate::error::{SyncError, SyncResult};

/// Type-erased queued work. Wrappers catch panics, so this never unwinds.
type Job = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// A queued command.
struct Command {
    id: u64,
    job: Job,
}

/// Handle to the eventual result of a queued command.
///
/// Dropping the future does not cancel the command.
#[must_use = "dropping a CommandFuture discards the command's result"]
pub struct CommandFuture<T> {
    receiver: Receiver<SyncResult<T>>,
}

impl<T> CommandFuture<T> {
    fn pending() -> (Sender<SyncResult<T>>, Self) {
        let (sender, receiver) = bounded(1);
        (sender, Self { receiver })
    }

    fn resolved(result: SyncResult<T>) -> Self {
        let (sender, future) = Self::pending();
        // Capacity 1 and nothing sent yet: cannot fail
        let _ = sender.send(result);
        future
    }

    /// Blocks until the command has run on the graphics thread.
    ///
    /// # Errors
    ///
    /// [`SyncError::CommandFailed`] if the command panicked or returned an
    /// error, [`SyncError::Disconnected`] if it was dropped without running,
    /// [`SyncError::QueueClosed`] if it was submitted after close.
    pub fn wait(self) -> SyncResult<T> {
        self.receiver.recv().unwrap_or(Err(SyncError::Disconnected))
    }

    /// Blocks for at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait), plus [`SyncError::Timeout`] if the command
    /// has not finished yet. The future stays usable after a timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> SyncResult<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SyncError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::Disconnected),
        }
    }

    /// Takes the result if it is available, without blocking.
    pub fn try_take(&self) -> Option<SyncResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SyncError::Disconnected)),
        }
    }

    /// Returns true once a result is waiting to be taken.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }
}

impl<T> fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Outcome of one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Commands run, failed ones included.
    pub executed: usize,
    /// Commands that panicked or returned an error.
    pub failed: usize,
}

/// Lifetime counters for a command queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Commands accepted onto the queue.
    pub submitted: u64,
    /// Commands run by a drain.
    pub executed: u64,
    /// Commands run inline because the caller was the graphics thread.
    pub executed_inline: u64,
    /// Commands that failed (queued or inline).
    pub failed: u64,
    /// Submissions rejected because the queue was closed.
    pub rejected: u64,
}

/// Thread-safe FIFO of work for the graphics-context thread.
pub struct CommandQueue {
    sender: Sender<Command>,
    receiver: Receiver<Command>,
    /// Thread allowed to drain and to run work inline.
    owner: RwLock<Option<ThreadId>>,
    /// Held shared while sending, exclusively while closing.
    closed: RwLock<bool>,
    next_id: AtomicU64,
    submitted: AtomicU64,
    executed: AtomicU64,
    executed_inline: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl CommandQueue {
    /// Creates a queue holding at most `capacity` pending commands.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than zero");
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            owner: RwLock::new(None),
            closed: RwLock::new(false),
            next_id: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            executed_inline: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Thread identity
    // =========================================================================

    /// Declares the calling thread to be the graphics-context thread.
    pub fn bind_current_thread(&self) {
        let current = thread::current();
        let mut owner = self.owner.write();
        if let Some(previous) = *owner {
            if previous != current.id() {
                tracing::debug!(
                    "command queue rebound from {:?} to {:?} ({})",
                    previous,
                    current.id(),
                    current.name().unwrap_or("unnamed")
                );
            }
        }
        *owner = Some(current.id());
    }

    /// Returns true if the calling thread is the bound graphics thread.
    #[must_use]
    pub fn is_graphics_thread(&self) -> bool {
        *self.owner.read() == Some(thread::current().id())
    }

    /// Thread the queue is bound to, if any.
    #[must_use]
    pub fn graphics_thread(&self) -> Option<ThreadId> {
        *self.owner.read()
    }

    /// Asserts that the caller is the graphics thread.
    ///
    /// # Panics
    ///
    /// Panics if called from any other thread. Touching the native context
    /// off-thread is a programming defect, not a recoverable error.
    #[track_caller]
    pub fn assert_graphics_thread(&self, operation: &str) {
        assert!(
            self.is_graphics_thread(),
            "{operation} must run on the graphics thread (called from {:?}); route it through the command queue",
            thread::current().name().unwrap_or("unnamed")
        );
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queues `work` and returns immediately (fire-and-forget).
    ///
    /// A failure inside `work` is logged by the drain and otherwise dropped.
    ///
    /// # Errors
    ///
    /// [`SyncError::QueueClosed`] after [`close`](Self::close).
    pub fn execute<F>(&self, work: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(move || {
            panic::catch_unwind(AssertUnwindSafe(work)).map_err(|p| panic_message(p.as_ref()))
        });
        self.submit(job)
    }

    /// Queues `work` and blocks until the graphics thread has run it.
    ///
    /// # Errors
    ///
    /// [`SyncError::CommandFailed`] if `work` panicked, plus the errors of
    /// [`CommandFuture::wait`].
    pub fn execute_blocking<F>(&self, work: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.calculate(work).wait()
    }

    /// Queues a computation and returns a future for its result.
    pub fn calculate<T, F>(&self, work: F) -> CommandFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_with_result(move || Ok(work()))
    }

    /// Queues a fallible computation. An `Err` resolves the future with
    /// [`SyncError::CommandFailed`] carrying the error's message.
    pub fn try_calculate<T, E, F>(&self, work: F) -> CommandFuture<T>
    where
        T: Send + 'static,
        E: fmt::Display,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.submit_with_result(move || work().map_err(|e| e.to_string()))
    }

    fn submit_with_result<T, F>(&self, work: F) -> CommandFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        let (sender, future) = CommandFuture::pending();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|p| Err(panic_message(p.as_ref())));
            match outcome {
                Ok(value) => {
                    let _ = sender.send(Ok(value));
                    Ok(())
                }
                Err(message) => {
                    let _ = sender.send(Err(SyncError::CommandFailed(message.clone())));
                    Err(message)
                }
            }
        });

        match self.submit(job) {
            Ok(()) => future,
            Err(err) => CommandFuture::resolved(Err(err)),
        }
    }

    fn submit(&self, job: Job) -> SyncResult<()> {
        let closed = self.closed.read();
        if *closed {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::QueueClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if self.is_graphics_thread() {
            drop(closed);
            self.executed_inline.fetch_add(1, Ordering::Relaxed);
            self.run(Command { id, job });
            return Ok(());
        }

        // Blocks while the queue is full; the graphics thread makes room.
        self.sender
            .send(Command { id, job })
            .map_err(|_| SyncError::Disconnected)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Draining (graphics thread only)
    // =========================================================================

    /// Runs every command that was queued when the drain started, in FIFO order.
    ///
    /// Commands submitted while draining wait for the next drain, so a busy
    /// producer cannot keep the graphics thread here forever.
    ///
    /// # Panics
    ///
    /// Panics if called off the graphics thread.
    pub fn drain(&self) -> DrainReport {
        self.assert_graphics_thread("CommandQueue::drain");
        self.drain_pending()
    }

    fn drain_pending(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let pending = self.receiver.len();
        for _ in 0..pending {
            let Ok(command) = self.receiver.try_recv() else {
                break;
            };
            report.executed += 1;
            if !self.run(command) {
                report.failed += 1;
            }
        }
        self.executed.fetch_add(report.executed as u64, Ordering::Relaxed);
        report
    }

    /// Runs one command; returns false if it failed.
    fn run(&self, command: Command) -> bool {
        match (command.job)() {
            Ok(()) => true,
            Err(message) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("graphics command #{} failed: {}", command.id, message);
                false
            }
        }
    }

    /// Rejects all further submissions.
    ///
    /// On the graphics thread this keeps draining while it waits, so
    /// producers blocked on a full queue can finish their send.
    pub fn close(&self) {
        let on_graphics_thread = self.is_graphics_thread();
        loop {
            if let Some(mut closed) = self.closed.try_write_for(Duration::from_millis(1)) {
                *closed = true;
                break;
            }
            if on_graphics_thread {
                self.drain_pending();
            }
        }
        tracing::debug!("command queue closed with {} pending", self.receiver.len());
    }

    /// Runs everything still queued. Call after [`close`](Self::close) so
    /// no caller is left waiting on a future that will never resolve.
    ///
    /// # Panics
    ///
    /// Panics if called off the graphics thread.
    pub fn drain_remaining(&self) -> DrainReport {
        self.assert_graphics_thread("CommandQueue::drain_remaining");
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_pending();
            if report.executed == 0 {
                return total;
            }
            total.executed += report.executed;
            total.failed += report.failed;
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Number of commands waiting to be drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Lifetime counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            executed_inline: self.executed_inline.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.pending())
            .field("owner", &self.graphics_thread())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
