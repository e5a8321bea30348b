//! # Renderer
//!
//! The graphics-thread side of the engine loop. Owns the backend and the
//! outstanding fences; nothing else may touch either.
//!
//! ```text
//! cycle:
//! ┌──────────────────────────────────────────────────────────────┐
//! │ 1. backend.poll() + fences.sweep()   retire finished frames  │
//! │ 2. commands.drain()                  run marshaled work      │
//! │ 3. buffer.start_read()               latest snapshot         │
//! │ 4. backend.draw()                                            │
//! │ 5. create_fence → attach to slot + track                     │
//! │ 6. read.finish()                     promote parked snapshot │
//! │ 7. publish FrameEvent::Drawn                                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use tessera_core::{
    CommandQueue, FenceConfig, FenceStats, FenceTracker, GpuCommandSync, ReadGuard, SyncResult,
    TripleBuffer,
};

use crate::backend::{DrawResult, GraphicsBackend};
use crate::engine::EngineContext;
use crate::events::{FrameEvent, FrameEvents};

/// Draws snapshots through a [`GraphicsBackend`].
pub struct Renderer<B> {
    backend: B,
    fences: FenceTracker,
    commands: Arc<CommandQueue>,
    buffer: Arc<TripleBuffer>,
    events: FrameEvents,
    frame: u64,
    live: bool,
}

impl<B: GraphicsBackend> Renderer<B> {
    /// Creates a renderer over `context`. The backend is not initialized yet.
    #[must_use]
    pub fn new(backend: B, context: &EngineContext, fences: FenceConfig) -> Self {
        Self {
            backend,
            fences: FenceTracker::new(fences),
            commands: Arc::clone(context.commands()),
            buffer: Arc::clone(context.buffer()),
            events: context.frame_events().clone(),
            frame: 0,
            live: false,
        }
    }

    /// Claims the calling thread as the graphics thread and brings up the
    /// native context.
    ///
    /// # Errors
    ///
    /// The backend's [`SyncError::ContextInit`](tessera_core::SyncError::ContextInit).
    pub fn init(&mut self) -> SyncResult<()> {
        self.commands.bind_current_thread();
        self.backend.init()?;
        self.live = true;
        tracing::info!(
            "renderer ready on {} ({})",
            std::thread::current().name().unwrap_or("unnamed"),
            self.backend.name()
        );
        Ok(())
    }

    /// Runs one graphics cycle and returns what was drawn.
    ///
    /// # Errors
    ///
    /// A backend draw failure. The read slot is released either way.
    ///
    /// # Panics
    ///
    /// Panics if called off the graphics thread.
    pub fn cycle(&mut self) -> SyncResult<DrawResult> {
        self.commands.assert_graphics_thread("Renderer::cycle");

        self.backend.poll();
        self.fences.sweep();

        let drained = self.commands.drain();
        if drained.failed > 0 {
            tracing::debug!("{} of {} graphics commands failed", drained.failed, drained.executed);
        }

        // Local handle so the read guard does not borrow self
        let buffer = Arc::clone(&self.buffer);
        let mut read = buffer.start_read();
        let mut result = DrawResult {
            generation: read.generation(),
            fresh: read.is_fresh(),
            frame: self.frame,
            ..DrawResult::default()
        };

        let start = Instant::now();
        let drawn = self.backend.draw(read.state(), &mut result);
        result.draw_time_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);

        if drawn.is_ok() {
            let fence = self.create_fence(&read);
            read.attach_fence(fence.clone());
            self.fences.push(fence);
        }
        result.swapped = read.finish();
        drawn?;

        self.frame += 1;
        self.events.publish(FrameEvent::Drawn(result));
        Ok(result)
    }

    /// Creates a fence for the work just submitted from `read`.
    ///
    /// # Panics
    ///
    /// Panics if called off the graphics thread.
    pub fn create_fence(&mut self, read: &ReadGuard<'_>) -> GpuCommandSync {
        self.commands.assert_graphics_thread("Renderer::create_fence");
        self.backend.create_fence(read.generation())
    }

    /// Closes the command queue, runs what is left on it, and destroys the
    /// native context.
    ///
    /// # Panics
    ///
    /// Panics if called off the graphics thread.
    pub fn shutdown(&mut self) {
        self.commands.assert_graphics_thread("Renderer::shutdown");

        self.commands.close();
        let report = self.commands.drain_remaining();
        if report.executed > 0 {
            tracing::info!("ran {} graphics commands queued before shutdown", report.executed);
        }

        if self.live {
            self.backend.destroy();
            self.live = false;
            self.fences.sweep();
            self.events.publish(FrameEvent::ContextLost);
        }
        tracing::info!(
            "renderer stopped after {} frames ({} fences outstanding)",
            self.frame,
            self.fences.outstanding()
        );
    }

    /// Frames drawn.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frame
    }

    /// Fence tracker statistics.
    #[must_use]
    pub fn fence_stats(&self) -> FenceStats {
        self.fences.stats()
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B> std::fmt::Debug for Renderer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("frame", &self.frame)
            .field("live", &self.live)
            .field("outstanding_fences", &self.fences.outstanding())
            .finish_non_exhaustive()
    }
}
