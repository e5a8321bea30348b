//! # Graphics Backend
//!
//! The native context behind a trait. Every method is called from the
//! graphics thread only; [`crate::Renderer`] enforces that.
//!
//! [`HeadlessBackend`] is a software stand-in: it "uploads" the snapshot's
//! GPU payloads by measuring them and completes fences a configurable number
//! of frames after submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tessera_core::{FenceSignal, GpuCommandSync, RenderState, SyncError, SyncResult};

/// What one draw did. Filled by the renderer and the backend together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawResult {
    /// Snapshot generation that was drawn.
    pub generation: u64,
    /// The snapshot was newer than the previous draw's.
    pub fresh: bool,
    /// A snapshot parked during this draw was promoted afterwards.
    pub swapped: bool,
    /// Entities in the snapshot.
    pub entities: usize,
    /// Entities that passed visibility.
    pub visible: usize,
    /// Point lights in the snapshot.
    pub point_lights: usize,
    /// Bytes handed to the driver.
    pub bytes_uploaded: usize,
    /// Renderer frame counter.
    pub frame: u64,
    /// Wall time spent in `draw`.
    pub draw_time_us: u64,
}

/// Native graphics context.
///
/// Created on any thread, then moved to the graphics thread, where `init`
/// acquires the real context.
pub trait GraphicsBackend: Send + 'static {
    /// Acquires the native context.
    ///
    /// # Errors
    ///
    /// [`SyncError::ContextInit`] if no usable context can be created.
    fn init(&mut self) -> SyncResult<()>;

    /// Lets the driver make progress (retire finished work).
    fn poll(&mut self);

    /// Submits one frame built from `state`.
    ///
    /// # Errors
    ///
    /// Driver-reported failures. The graphics loop stops on error.
    fn draw(&mut self, state: &RenderState, result: &mut DrawResult) -> SyncResult<()>;

    /// Creates a fence that signals when the work submitted so far completes.
    fn create_fence(&mut self, generation: u64) -> GpuCommandSync;

    /// Releases the native context.
    fn destroy(&mut self);

    /// Human-readable backend name (for logs).
    fn name(&self) -> &str {
        "backend"
    }
}

/// Headless backend configuration.
#[derive(Clone, Debug, Default)]
pub struct HeadlessConfig {
    /// Frames between submission and fence completion.
    pub fence_latency_frames: u64,
    /// If set, `init` fails with this message.
    pub fail_init: Option<String>,
}

/// Probe that completes once the backend has retired submission `target`.
struct SubmissionProbe {
    completed: Arc<AtomicU64>,
    target: u64,
}

impl FenceSignal for SubmissionProbe {
    fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.target
    }
}

/// Software backend for tests, benches and the demo.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    config: HeadlessConfig,
    initialized: bool,
    destroyed: bool,
    submitted: u64,
    completed: Arc<AtomicU64>,
    bytes_uploaded: u64,
}

impl HeadlessBackend {
    /// Creates a backend whose fences signal on the next poll.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeadlessConfig::default())
    }

    /// Creates a backend with explicit settings.
    #[must_use]
    pub fn with_config(config: HeadlessConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Creates a backend whose fences lag `frames` polls behind submission.
    #[must_use]
    pub fn with_fence_latency(frames: u64) -> Self {
        Self::with_config(HeadlessConfig {
            fence_latency_frames: frames,
            fail_init: None,
        })
    }

    /// Creates a backend whose `init` always fails.
    #[must_use]
    pub fn failing_init(message: impl Into<String>) -> Self {
        Self::with_config(HeadlessConfig {
            fence_latency_frames: 0,
            fail_init: Some(message.into()),
        })
    }

    /// Frames submitted so far.
    #[must_use]
    pub fn frames_submitted(&self) -> u64 {
        self.submitted
    }

    /// Frames the "driver" has retired.
    #[must_use]
    pub fn frames_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Total bytes uploaded.
    #[must_use]
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Returns whether `init` succeeded and `destroy` has not run.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.initialized && !self.destroyed
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn init(&mut self) -> SyncResult<()> {
        if let Some(message) = &self.config.fail_init {
            return Err(SyncError::ContextInit(message.clone()));
        }
        self.initialized = true;
        tracing::info!(
            "headless context ready (fence latency {} frames)",
            self.config.fence_latency_frames
        );
        Ok(())
    }

    fn poll(&mut self) {
        let retired = self.submitted.saturating_sub(self.config.fence_latency_frames);
        self.completed.fetch_max(retired, Ordering::AcqRel);
    }

    fn draw(&mut self, state: &RenderState, result: &mut DrawResult) -> SyncResult<()> {
        if !self.is_live() {
            return Err(SyncError::CommandFailed("draw on an uninitialized context".into()));
        }

        let bytes = state.camera_bytes().len() + state.entity_bytes().len() + state.point_light_bytes().len();
        self.submitted += 1;
        self.bytes_uploaded += bytes as u64;

        result.entities = state.entities().len();
        result.visible = state.visible().len();
        result.point_lights = state.point_lights().len();
        result.bytes_uploaded = bytes;
        Ok(())
    }

    fn create_fence(&mut self, generation: u64) -> GpuCommandSync {
        GpuCommandSync::new(
            generation,
            SubmissionProbe {
                completed: Arc::clone(&self.completed),
                target: self.submitted,
            },
        )
    }

    fn destroy(&mut self) {
        // Everything submitted is retired on teardown
        self.completed.fetch_max(self.submitted, Ordering::AcqRel);
        self.destroyed = true;
        tracing::info!(
            "headless context destroyed after {} frames ({} bytes)",
            self.submitted,
            self.bytes_uploaded
        );
    }

    fn name(&self) -> &str {
        "headless"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{BufferHandle, EntityInstance, TripleBuffer};

    fn committed_state() -> TripleBuffer {
        let buffer = TripleBuffer::new();
        let mut write = buffer.begin_write();
        write.upsert_entity(EntityInstance::new(1, [0.0; 3], 0, BufferHandle(0)));
        write.commit();
        buffer
    }

    #[test]
    fn test_failing_init() {
        let mut backend = HeadlessBackend::failing_init("no adapter");
        assert_eq!(
            backend.init(),
            Err(SyncError::ContextInit("no adapter".into()))
        );
        assert!(!backend.is_live());
    }

    #[test]
    fn test_draw_requires_init() {
        let buffer = committed_state();
        let read = buffer.start_read();
        let mut backend = HeadlessBackend::new();
        let mut result = DrawResult::default();
        assert!(backend.draw(read.state(), &mut result).is_err());
    }

    #[test]
    fn test_draw_measures_payload() {
        let buffer = committed_state();
        let read = buffer.start_read();
        let mut backend = HeadlessBackend::new();
        backend.init().unwrap();

        let mut result = DrawResult::default();
        backend.draw(read.state(), &mut result).unwrap();
        assert_eq!(result.entities, 1);
        assert_eq!(
            result.bytes_uploaded,
            tessera_core::CameraData::SIZE + EntityInstance::SIZE
        );
        assert_eq!(backend.frames_submitted(), 1);
    }

    #[test]
    fn test_fence_latency() {
        let buffer = committed_state();
        let mut backend = HeadlessBackend::with_fence_latency(2);
        backend.init().unwrap();

        let read = buffer.start_read();
        let mut result = DrawResult::default();
        backend.draw(read.state(), &mut result).unwrap();
        let fence = backend.create_fence(read.generation());
        drop(read);

        backend.poll();
        assert!(!fence.is_signaled());

        // Two more frames retire the first
        for _ in 0..2 {
            let read = buffer.start_read();
            backend.draw(read.state(), &mut result).unwrap();
        }
        backend.poll();
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_destroy_retires_everything() {
        let mut backend = HeadlessBackend::with_fence_latency(100);
        backend.init().unwrap();
        let buffer = committed_state();
        let read = buffer.start_read();
        backend.draw(read.state(), &mut DrawResult::default()).unwrap();
        let fence = backend.create_fence(1);

        backend.destroy();
        assert!(fence.is_signaled());
        assert!(!backend.is_live());
    }
}
