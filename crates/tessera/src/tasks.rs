//! # Scheduler Specializations
//!
//! ```text
//! Multi-threaded:
//!   simulation thread:  advance → begin_write → write_state → visibility → commit
//!   graphics thread:    poll → drain commands → start_read → draw → fence → finish
//!
//! Single-threaded:
//!   simulation thread:  advance → begin_write → ... → commit → renderer cycle
//! ```

use std::sync::Arc;

use tessera_core::{SyncResult, TimeStepTask, TripleBuffer};

use crate::backend::GraphicsBackend;
use crate::renderer::Renderer;
use crate::scene::{Scene, Visibility};

/// Produces one snapshot per tick. In single-threaded mode it also owns the
/// renderer and draws what it just committed.
pub struct SimulationTask<S, V, B> {
    scene: S,
    visibility: V,
    buffer: Arc<TripleBuffer>,
    renderer: Option<Renderer<B>>,
}

impl<S: Scene, V: Visibility, B: GraphicsBackend> SimulationTask<S, V, B> {
    /// Simulation for multi-threaded mode (a separate graphics thread draws).
    #[must_use]
    pub fn new(scene: S, visibility: V, buffer: Arc<TripleBuffer>) -> Self {
        Self {
            scene,
            visibility,
            buffer,
            renderer: None,
        }
    }

    /// Simulation that also drives `renderer` on the same thread.
    #[must_use]
    pub fn single_threaded(scene: S, visibility: V, buffer: Arc<TripleBuffer>, renderer: Renderer<B>) -> Self {
        Self {
            scene,
            visibility,
            buffer,
            renderer: Some(renderer),
        }
    }

    /// Runs one simulation step and commits it. Returns the generation.
    fn step(&mut self, seconds: f32) -> u64 {
        self.scene.advance(seconds);

        let mut write = self.buffer.begin_write();
        self.scene.write_state(&mut write);
        let (camera, entities, visible) = write.visibility_io();
        visible.clear();
        self.visibility.query(camera, entities, visible);
        write.commit()
    }
}

impl<S: Scene, V: Visibility, B: GraphicsBackend> TimeStepTask for SimulationTask<S, V, B> {
    fn init(&mut self) -> SyncResult<()> {
        match &mut self.renderer {
            Some(renderer) => renderer.init(),
            None => Ok(()),
        }
    }

    fn update(&mut self, seconds: f32) -> SyncResult<()> {
        let generation = self.step(seconds);
        tracing::trace!("committed generation {}", generation);

        if let Some(renderer) = &mut self.renderer {
            let result = renderer.cycle()?;
            debug_assert_eq!(result.generation, generation);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(renderer) = &mut self.renderer {
            renderer.shutdown();
        }
    }
}

/// Draws on a dedicated graphics thread.
pub struct GraphicsTask<B> {
    renderer: Renderer<B>,
}

impl<B: GraphicsBackend> GraphicsTask<B> {
    /// Wraps `renderer`; its backend initializes on the graphics thread.
    #[must_use]
    pub fn new(renderer: Renderer<B>) -> Self {
        Self { renderer }
    }
}

impl<B: GraphicsBackend> TimeStepTask for GraphicsTask<B> {
    fn init(&mut self) -> SyncResult<()> {
        self.renderer.init()
    }

    fn update(&mut self, _seconds: f32) -> SyncResult<()> {
        self.renderer.cycle().map(|_| ())
    }

    fn cleanup(&mut self) {
        self.renderer.shutdown();
    }
}
