//! # GPU Completion Fences
//!
//! A fence answers one question: "has the driver finished with the work
//! issued for snapshot N?"
//!
//! ```text
//! create ──> pending ──> signaled ──> discarded
//!    │                      ^
//!    └── backend probe ─────┘   (latched: never goes back to pending)
//! ```
//!
//! The graphics thread keeps every outstanding fence in a [`FenceTracker`]
//! and sweeps it once per cycle. The same fence handle is attached to the
//! triple-buffer slot it guards, so the producer can tell whether that slot
//! is safe to overwrite.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::FenceConfig;

/// Backend-provided completion probe.
///
/// Implementations must be cheap to call; the graphics thread polls every
/// outstanding fence once per cycle.
pub trait FenceSignal: Send + Sync {
    /// Returns true once the driver has finished the guarded work.
    fn is_complete(&self) -> bool;
}

/// Probe that is complete from the start.
struct AlreadySignaled;

impl FenceSignal for AlreadySignaled {
    fn is_complete(&self) -> bool {
        true
    }
}

struct FenceInner {
    generation: u64,
    signaled: AtomicBool,
    probe: Box<dyn FenceSignal>,
}

/// Pollable completion marker for one snapshot generation.
///
/// Cloning is cheap (shared handle). Once any clone observes the fence as
/// signaled the result is latched for all clones.
#[derive(Clone)]
pub struct GpuCommandSync {
    inner: Arc<FenceInner>,
}

impl GpuCommandSync {
    /// Creates a pending fence for `generation` backed by `probe`.
    #[must_use]
    pub fn new(generation: u64, probe: impl FenceSignal + 'static) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                generation,
                signaled: AtomicBool::new(false),
                probe: Box::new(probe),
            }),
        }
    }

    /// Creates a fence that is already signaled.
    #[must_use]
    pub fn signaled(generation: u64) -> Self {
        let fence = Self::new(generation, AlreadySignaled);
        fence.inner.signaled.store(true, Ordering::Release);
        fence
    }

    /// Snapshot generation this fence guards.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Polls the fence. Monotonic: once true, always true.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        if self.inner.signaled.load(Ordering::Acquire) {
            return true;
        }
        if self.inner.probe.is_complete() {
            self.inner.signaled.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Spins (yielding) until signaled or `timeout` elapses.
    ///
    /// Returns true if the fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        while !self.is_signaled() {
            if Instant::now() >= deadline {
                return false;
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        true
    }
}

impl fmt::Debug for GpuCommandSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuCommandSync")
            .field("generation", &self.inner.generation)
            .field("signaled", &self.inner.signaled.load(Ordering::Relaxed))
            .finish()
    }
}

/// Fence tracker statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FenceStats {
    /// Fences created and pushed.
    pub created: u64,
    /// Fences observed signaled and discarded.
    pub retired: u64,
    /// Times `push` found the list over its bound.
    pub overflow_stalls: u64,
    /// Overflow waits that gave up with the oldest fence still pending.
    pub overflow_timeouts: u64,
}

/// The graphics thread's list of outstanding fences.
///
/// Not thread-safe: owned by the graphics thread.
pub struct FenceTracker {
    outstanding: VecDeque<GpuCommandSync>,
    config: FenceConfig,
    stats: FenceStats,
}

impl FenceTracker {
    /// Creates an empty tracker with the given bound.
    #[must_use]
    pub fn new(config: FenceConfig) -> Self {
        Self {
            outstanding: VecDeque::with_capacity(config.max_outstanding + 1),
            config,
            stats: FenceStats::default(),
        }
    }

    /// Records a new outstanding fence.
    ///
    /// If the list is already at `max_outstanding`, waits on the oldest fence
    /// for up to `overflow_wait` first. Signaled fences are swept before the
    /// new one is added.
    pub fn push(&mut self, fence: GpuCommandSync) {
        if self.outstanding.len() >= self.config.max_outstanding {
            self.stats.overflow_stalls += 1;
            if let Some(oldest) = self.outstanding.front() {
                if !oldest.wait_timeout(self.config.overflow_wait()) {
                    self.stats.overflow_timeouts += 1;
                    tracing::warn!(
                        "fence for generation {} still pending after {:?} ({} outstanding)",
                        oldest.generation(),
                        self.config.overflow_wait(),
                        self.outstanding.len()
                    );
                }
            }
            self.sweep();
        }
        self.stats.created += 1;
        self.outstanding.push_back(fence);
    }

    /// Discards signaled fences, keeps pending ones in order.
    ///
    /// Returns the number of fences retired.
    pub fn sweep(&mut self) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|fence| !fence.is_signaled());
        let retired = before - self.outstanding.len();
        self.stats.retired += retired as u64;
        retired
    }

    /// Number of fences still pending (as of the last sweep or push).
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Generation guarded by the oldest outstanding fence.
    #[must_use]
    pub fn oldest_generation(&self) -> Option<u64> {
        self.outstanding.front().map(GpuCommandSync::generation)
    }

    /// Returns tracker statistics.
    #[must_use]
    pub fn stats(&self) -> FenceStats {
        self.stats
    }
}

impl Default for FenceTracker {
    fn default() -> Self {
        Self::new(FenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Probe controlled by the test.
    #[derive(Clone)]
    struct Switch(Arc<AtomicBool>);

    impl Switch {
        fn new() -> Self {
            Self(Arc::new(AtomicBool::new(false)))
        }

        fn flip(&self, value: bool) {
            self.0.store(value, Ordering::Release);
        }
    }

    impl FenceSignal for Switch {
        fn is_complete(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    #[test]
    fn test_fence_latches() {
        let switch = Switch::new();
        let fence = GpuCommandSync::new(7, switch.clone());
        assert_eq!(fence.generation(), 7);
        assert!(!fence.is_signaled());

        switch.flip(true);
        assert!(fence.is_signaled());

        // A misbehaving probe going back to false must not un-signal the fence
        switch.flip(false);
        assert!(fence.is_signaled());
        assert!(fence.clone().is_signaled());
    }

    #[test]
    fn test_signaled_constructor() {
        assert!(GpuCommandSync::signaled(1).is_signaled());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let fence = GpuCommandSync::new(1, Switch::new());
        let start = Instant::now();
        assert!(!fence.wait_timeout(Duration::from_millis(5)));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_wait_timeout_signals_from_other_thread() {
        let switch = Switch::new();
        let fence = GpuCommandSync::new(1, switch.clone());

        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(2));
            switch.flip(true);
        });

        assert!(fence.wait_timeout(Duration::from_secs(5)));
        signaller.join().unwrap();
    }

    #[test]
    fn test_tracker_sweep_keeps_pending_in_order() {
        let mut tracker = FenceTracker::default();
        let switches: Vec<Switch> = (0..4).map(|_| Switch::new()).collect();
        for (i, s) in switches.iter().enumerate() {
            tracker.push(GpuCommandSync::new(i as u64, s.clone()));
        }
        assert_eq!(tracker.outstanding(), 4);

        switches[0].flip(true);
        switches[2].flip(true);
        assert_eq!(tracker.sweep(), 2);
        assert_eq!(tracker.outstanding(), 2);
        assert_eq!(tracker.oldest_generation(), Some(1));
        assert_eq!(tracker.stats().retired, 2);
    }

    #[test]
    fn test_tracker_overflow_waits_then_keeps_going() {
        let mut tracker = FenceTracker::new(FenceConfig {
            max_outstanding: 2,
            overflow_wait_ms: 1,
        });

        tracker.push(GpuCommandSync::new(0, Switch::new()));
        tracker.push(GpuCommandSync::new(1, Switch::new()));
        // Over the bound with nothing signaling: stall is recorded, push still succeeds
        tracker.push(GpuCommandSync::new(2, Switch::new()));

        let stats = tracker.stats();
        assert_eq!(stats.overflow_stalls, 1);
        assert_eq!(stats.overflow_timeouts, 1);
        assert_eq!(stats.created, 3);
        assert_eq!(tracker.outstanding(), 3);
    }

    #[test]
    fn test_tracker_overflow_reclaims_signaled() {
        let mut tracker = FenceTracker::new(FenceConfig {
            max_outstanding: 1,
            overflow_wait_ms: 100,
        });
        tracker.push(GpuCommandSync::signaled(0));
        tracker.push(GpuCommandSync::new(1, Switch::new()));

        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.stats().overflow_timeouts, 0);
        assert_eq!(tracker.oldest_generation(), Some(1));
    }
}
