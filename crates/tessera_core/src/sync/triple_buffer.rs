//! # Triple-Buffered Scene State
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────────┐
//!                    │             TripleBuffer            │
//!                    │                                     │
//!                    │  ┌────────┐ ┌────────┐ ┌────────┐   │
//!                    │  │ slot 0 │ │ slot 1 │ │ slot 2 │   │
//!                    │  └───┬────┘ └───┬────┘ └───┬────┘   │
//!                    │      │          │          │        │
//!                    │  ┌───┴──────────┴──────────┴────┐   │
//!                    │  │ roles: WRITE / READ / SPARE  │   │
//!                    │  │ + per-slot fence             │   │
//!                    │  └──────────────────────────────┘   │
//!                    └─────────────────────────────────────┘
//!                              │               │
//!                    ┌─────────┴───┐     ┌─────┴───────┐
//!                    │ WriteGuard  │     │  ReadGuard  │
//!                    │ (simulation)│     │ (graphics)  │
//!                    └─────────────┘     └─────────────┘
//! ```
//!
//! ## Per-cycle contract (producer)
//!
//! 1. [`TripleBuffer::begin_write`]: bring the WRITE slot up to date with the
//!    latest committed snapshot, apply deferred commands, apply requested
//!    singleton actions.
//! 2. Direct writes through the [`WriteGuard`].
//! 3. [`WriteGuard::commit`]: freeze and rotate.
//!
//! Each slot sits behind its own `RwLock`. Roles guarantee the locks are never
//! contended between producer and consumer; they exist so the handoff needs
//! no `unsafe`.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::command::panic_message;
use crate::error::{SyncError, SyncResult};
use crate::fence::GpuCommandSync;
use crate::state::{RenderState, StateCommand};

/// Idempotent action that can be requested at most once per cycle.
type SingletonAction = Arc<dyn Fn(&mut RenderState) + Send + Sync + 'static>;

/// Default time `begin_write` waits on a pending fence.
const DEFAULT_FENCE_WAIT: Duration = Duration::from_millis(50);

/// Snapshot of the role assignment (for diagnostics and tests).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRoles {
    /// Slot the producer writes into.
    pub write: usize,
    /// Slot the consumer reads from.
    pub read: usize,
    /// The third slot.
    pub spare: usize,
    /// SPARE holds a committed snapshot newer than READ.
    pub spare_fresh: bool,
    /// A read guard is alive.
    pub read_busy: bool,
}

/// Role bookkeeping. Guarded by one mutex, held only for index shuffling.
struct RoleTable {
    roles: SlotRoles,
    /// Physical slot holding the most recent commit.
    latest: Option<usize>,
    /// Fence guarding each slot's last draw.
    fences: [Option<GpuCommandSync>; 3],
}

/// Mutations waiting for the next write snapshot.
#[derive(Default)]
struct PendingMutations {
    commands: Vec<StateCommand>,
    /// Requested singleton tags, in first-request order.
    singletons: Vec<String>,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    parked_commits: AtomicU64,
    true_swaps: AtomicU64,
    reads: AtomicU64,
    stale_reads: AtomicU64,
    fence_waits: AtomicU64,
    fence_timeouts: AtomicU64,
    commands_applied: AtomicU64,
    singletons_applied: AtomicU64,
    mutations_failed: AtomicU64,
}

/// Triple buffer statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TripleBufferStats {
    /// Snapshots committed.
    pub commits: u64,
    /// Commits parked in SPARE because the reader was busy.
    pub parked_commits: u64,
    /// Parked snapshots promoted to READ when a read finished.
    pub true_swaps: u64,
    /// Reads started.
    pub reads: u64,
    /// Reads that returned an already-seen generation.
    pub stale_reads: u64,
    /// `begin_write` calls that found the slot's fence pending.
    pub fence_waits: u64,
    /// Fence waits that gave up and reused the slot anyway.
    pub fence_timeouts: u64,
    /// Deferred commands applied.
    pub commands_applied: u64,
    /// Singleton actions applied.
    pub singletons_applied: u64,
    /// Deferred commands or singleton actions that panicked.
    pub mutations_failed: u64,
}

/// Three scene snapshots with rotating WRITE / READ / SPARE roles.
///
/// ## Usage
///
/// ```rust,ignore
/// let buffer = Arc::new(TripleBuffer::new());
///
/// // Simulation thread
/// let mut write = buffer.begin_write();
/// write.set_camera(camera);
/// let generation = write.commit();
///
/// // Graphics thread
/// let mut read = buffer.start_read();
/// backend.draw(&read);
/// read.attach_fence(backend.create_fence(read.generation()));
/// let swapped = read.finish();
/// ```
pub struct TripleBuffer {
    slots: [RwLock<RenderState>; 3],
    table: Mutex<RoleTable>,
    pending: Mutex<PendingMutations>,
    actions: RwLock<HashMap<String, SingletonAction>>,
    /// Whether a write guard is alive.
    write_active: AtomicBool,
    committed_generation: AtomicU64,
    last_read_generation: AtomicU64,
    fence_wait_timeout: Duration,
    counters: Counters,
}

impl TripleBuffer {
    /// Creates a buffer with three empty snapshots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fence_wait_timeout(DEFAULT_FENCE_WAIT)
    }

    /// Creates a buffer whose `begin_write` waits at most `timeout` on a
    /// pending fence before reusing the slot anyway.
    #[must_use]
    pub fn with_fence_wait_timeout(timeout: Duration) -> Self {
        Self {
            slots: [
                RwLock::new(RenderState::new()),
                RwLock::new(RenderState::new()),
                RwLock::new(RenderState::new()),
            ],
            table: Mutex::new(RoleTable {
                roles: SlotRoles {
                    write: 0,
                    read: 1,
                    spare: 2,
                    spare_fresh: false,
                    read_busy: false,
                },
                latest: None,
                fences: [None, None, None],
            }),
            pending: Mutex::new(PendingMutations::default()),
            actions: RwLock::new(HashMap::new()),
            write_active: AtomicBool::new(false),
            committed_generation: AtomicU64::new(0),
            last_read_generation: AtomicU64::new(0),
            fence_wait_timeout: timeout,
            counters: Counters::default(),
        }
    }

    // =========================================================================
    // Deferred mutations (any thread)
    // =========================================================================

    /// Queues a mutation against the next write snapshot.
    pub fn add_command<F>(&self, command: F)
    where
        F: FnOnce(&mut RenderState) + Send + 'static,
    {
        self.pending.lock().commands.push(Box::new(command));
    }

    /// Registers a named idempotent action. Replaces any previous action
    /// with the same tag.
    pub fn register_singleton_action<F>(&self, tag: impl Into<String>, action: F)
    where
        F: Fn(&mut RenderState) + Send + Sync + 'static,
    {
        self.actions.write().insert(tag.into(), Arc::new(action));
    }

    /// Requests `tag` for the next write snapshot.
    ///
    /// Returns `Ok(true)` if newly queued, `Ok(false)` if it was already
    /// queued this cycle.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownAction`] if no action is registered under `tag`.
    pub fn request_singleton_action(&self, tag: &str) -> SyncResult<bool> {
        if !self.actions.read().contains_key(tag) {
            return Err(SyncError::UnknownAction(tag.to_owned()));
        }
        let mut pending = self.pending.lock();
        if pending.singletons.iter().any(|t| t == tag) {
            return Ok(false);
        }
        pending.singletons.push(tag.to_owned());
        Ok(true)
    }

    /// Number of deferred commands waiting for the next write snapshot.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.pending.lock().commands.len()
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Acquires the WRITE snapshot for this cycle.
    ///
    /// Waits (bounded) if the slot's last draw fence has not signaled, copies
    /// the latest committed snapshot into the slot, then applies deferred
    /// commands and requested singleton actions in that order.
    ///
    /// # Panics
    ///
    /// Panics if a write guard is already alive (only one producer allowed).
    #[must_use]
    pub fn begin_write(&self) -> WriteGuard<'_> {
        let was_active = self.write_active.swap(true, Ordering::AcqRel);
        assert!(!was_active, "Double write handle! Only one write handle allowed at a time.");
        let token = WriteToken { buffer: self };

        let (slot, latest, fence) = {
            let mut table = self.table.lock();
            let slot = table.roles.write;
            (slot, table.latest, table.fences[slot].take())
        };

        if let Some(fence) = fence {
            self.wait_for_slot_fence(slot, &fence);
        }

        let mut state = self.slots[slot].write();
        if let Some(latest) = latest.filter(|&l| l != slot) {
            state.sync_from(&self.slots[latest].read());
        }
        state.begin_cycle(self.committed_generation.load(Ordering::Acquire) + 1);

        let mut guard = WriteGuard { token, slot, state };
        self.apply_pending(&mut guard.state);
        guard
    }

    fn wait_for_slot_fence(&self, slot: usize, fence: &GpuCommandSync) {
        if fence.is_signaled() {
            return;
        }
        self.counters.fence_waits.fetch_add(1, Ordering::Relaxed);
        if !fence.wait_timeout(self.fence_wait_timeout) {
            self.counters.fence_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "slot {} reused with fence for generation {} still pending after {:?}",
                slot,
                fence.generation(),
                self.fence_wait_timeout
            );
        }
    }

    fn apply_pending(&self, state: &mut RenderState) {
        let (commands, singletons) = {
            let mut pending = self.pending.lock();
            (
                std::mem::take(&mut pending.commands),
                std::mem::take(&mut pending.singletons),
            )
        };

        let command_count = commands.len() as u64;
        for (index, command) in commands.into_iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| command(&mut *state))) {
                self.counters.mutations_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "deferred command {} for generation {} panicked: {}",
                    index,
                    state.generation(),
                    panic_message(payload.as_ref())
                );
            }
        }
        self.counters.commands_applied.fetch_add(command_count, Ordering::Relaxed);

        if singletons.is_empty() {
            return;
        }
        // Clone out so an action may register or request others without deadlocking
        let actions: Vec<(String, SingletonAction)> = {
            let registry = self.actions.read();
            singletons
                .into_iter()
                .filter_map(|tag| registry.get(&tag).cloned().map(|action| (tag, action)))
                .collect()
        };
        for (tag, action) in &actions {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action(&mut *state))) {
                self.counters.mutations_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "singleton action \"{}\" for generation {} panicked: {}",
                    tag,
                    state.generation(),
                    panic_message(payload.as_ref())
                );
            }
        }
        self.counters
            .singletons_applied
            .fetch_add(actions.len() as u64, Ordering::Relaxed);
    }

    /// Rotates roles after `slot` was committed as `generation`.
    fn publish(&self, slot: usize, generation: u64) {
        let mut table = self.table.lock();
        let RoleTable { roles, latest, fences } = &mut *table;
        debug_assert_eq!(roles.write, slot);

        if roles.read_busy {
            // Reader is draining READ: park the commit, write into the old spare
            let old_spare = roles.spare;
            roles.spare = slot;
            roles.write = old_spare;
            roles.spare_fresh = true;
            self.counters.parked_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            // Reader idle: publish directly, reclaim whichever free slot is ready
            let (old_read, old_spare) = (roles.read, roles.spare);
            let ready = |i: usize| fences[i].as_ref().map_or(true, GpuCommandSync::is_signaled);
            let (next_write, next_spare) = if ready(old_spare) || !ready(old_read) {
                (old_spare, old_read)
            } else {
                (old_read, old_spare)
            };
            roles.read = slot;
            roles.write = next_write;
            roles.spare = next_spare;
            roles.spare_fresh = false;
        }

        *latest = Some(slot);
        debug_assert_ne!(roles.write, roles.read);
        self.committed_generation.store(generation, Ordering::Release);
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Consumer side
    // =========================================================================

    /// Acquires the most recently committed snapshot. Never blocks.
    ///
    /// Returns the previous snapshot again if nothing new was committed.
    ///
    /// # Panics
    ///
    /// Panics if a read guard is already alive (one consumer).
    #[must_use]
    pub fn start_read(&self) -> ReadGuard<'_> {
        let slot = {
            let mut table = self.table.lock();
            assert!(!table.roles.read_busy, "Double read handle! Only one reader allowed at a time.");
            debug_assert!(!table.roles.spare_fresh, "parked snapshot left unpromoted");
            table.roles.read_busy = true;
            table.roles.read
        };

        let state = self.slots[slot].read();
        let generation = state.generation();
        let previous = self.last_read_generation.swap(generation, Ordering::AcqRel);
        let fresh = generation > previous;

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        if !fresh {
            self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
        }

        ReadGuard {
            buffer: self,
            slot,
            state,
            fresh,
            fence: None,
            released: false,
        }
    }

    /// Releases the read slot. Returns true if a parked snapshot was promoted.
    fn stop_read(&self, slot: usize, fence: Option<GpuCommandSync>) -> bool {
        let mut table = self.table.lock();
        if fence.is_some() {
            table.fences[slot] = fence;
        }
        let roles = &mut table.roles;
        roles.read_busy = false;

        if roles.spare_fresh {
            std::mem::swap(&mut roles.read, &mut roles.spare);
            roles.spare_fresh = false;
            self.counters.true_swaps.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Generation of the most recent commit (0 before the first).
    #[inline]
    #[must_use]
    pub fn committed_generation(&self) -> u64 {
        self.committed_generation.load(Ordering::Acquire)
    }

    /// Returns whether a write guard is currently alive.
    #[inline]
    #[must_use]
    pub fn is_write_active(&self) -> bool {
        self.write_active.load(Ordering::Acquire)
    }

    /// Current role assignment.
    #[must_use]
    pub fn roles(&self) -> SlotRoles {
        self.table.lock().roles
    }

    /// Returns statistics.
    #[must_use]
    pub fn stats(&self) -> TripleBufferStats {
        let c = &self.counters;
        TripleBufferStats {
            commits: c.commits.load(Ordering::Relaxed),
            parked_commits: c.parked_commits.load(Ordering::Relaxed),
            true_swaps: c.true_swaps.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            stale_reads: c.stale_reads.load(Ordering::Relaxed),
            fence_waits: c.fence_waits.load(Ordering::Relaxed),
            fence_timeouts: c.fence_timeouts.load(Ordering::Relaxed),
            commands_applied: c.commands_applied.load(Ordering::Relaxed),
            singletons_applied: c.singletons_applied.load(Ordering::Relaxed),
            mutations_failed: c.mutations_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for TripleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TripleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripleBuffer")
            .field("roles", &self.roles())
            .field("committed_generation", &self.committed_generation())
            .finish_non_exhaustive()
    }
}

/// Releases the single-writer flag when the write guard goes away.
struct WriteToken<'a> {
    buffer: &'a TripleBuffer,
}

impl Drop for WriteToken<'_> {
    fn drop(&mut self) {
        self.buffer.write_active.store(false, Ordering::Release);
    }
}

/// Exclusive access to the WRITE snapshot.
///
/// Dropping it without [`commit`](Self::commit) abandons the cycle: the slot
/// stays WRITE and is rebuilt by the next `begin_write`.
pub struct WriteGuard<'a> {
    token: WriteToken<'a>,
    slot: usize,
    state: RwLockWriteGuard<'a, RenderState>,
}

impl WriteGuard<'_> {
    /// Physical slot index (for debugging).
    #[inline]
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation this snapshot will be committed as.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation()
    }

    /// Freezes the snapshot and makes it the newest readable one.
    ///
    /// Returns the committed generation.
    pub fn commit(self) -> u64 {
        let WriteGuard { token, slot, mut state } = self;
        state.mark_committed();
        let generation = state.generation();
        // Unlock before publishing so the reader never waits on this slot
        drop(state);
        token.buffer.publish(slot, generation);
        drop(token);
        generation
    }
}

impl Deref for WriteGuard<'_> {
    type Target = RenderState;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for WriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

/// Shared access to the READ snapshot.
///
/// Dropping it is equivalent to [`finish`](Self::finish).
pub struct ReadGuard<'a> {
    buffer: &'a TripleBuffer,
    slot: usize,
    state: RwLockReadGuard<'a, RenderState>,
    fresh: bool,
    fence: Option<GpuCommandSync>,
    released: bool,
}

impl ReadGuard<'_> {
    /// Physical slot index (for debugging).
    #[inline]
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation of the snapshot being read.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation()
    }

    /// True if this snapshot is newer than the one the previous read saw.
    #[inline]
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// The snapshot.
    #[inline]
    #[must_use]
    pub fn state(&self) -> &RenderState {
        &self.state
    }

    /// Records the fence guarding the draw issued from this snapshot.
    ///
    /// The slot will not be handed to the producer before the fence
    /// signals (or the producer's wait budget runs out).
    pub fn attach_fence(&mut self, fence: GpuCommandSync) {
        self.fence = Some(fence);
    }

    /// Releases the read slot.
    ///
    /// Returns true if a snapshot committed during the read was promoted to
    /// READ (a true swap), false if the next read would see the same data.
    pub fn finish(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.buffer.stop_read(self.slot, self.fence.take())
    }
}

impl Deref for ReadGuard<'_> {
    type Target = RenderState;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
