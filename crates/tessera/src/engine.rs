//! # Engine
//!
//! Owns the shared context and the two scheduler threads.
//!
//! ```text
//!                     ┌───────────────── EngineContext ─────────────────┐
//!                     │  Arc<TripleBuffer>  Arc<CommandQueue>  events   │
//!                     └───────┬───────────────────┬────────────────┬────┘
//!                             │                   │                │
//!  Multi:   [simulation] ─────┘      [graphics] ──┴── drain        └──> observers
//!  Single:  [simulation + renderer] ──────────────┘
//! ```
//!
//! Startup brings up the graphics side first so a context failure is
//! reported before any simulation runs. Shutdown goes the other way:
//! simulation stops first, then graphics closes the queue and destroys the
//! context.

use std::sync::Arc;

use tessera_core::{
    CommandQueue, EngineConfig, SchedulerHandle, SchedulerState, SyncError, SyncResult,
    ThreadingMode, TimeStepThread, TripleBuffer,
};

use crate::backend::GraphicsBackend;
use crate::events::FrameEvents;
use crate::notify::SceneNotifier;
use crate::renderer::Renderer;
use crate::scene::{AllVisible, Scene, Visibility};
use crate::tasks::{GraphicsTask, SimulationTask};

/// Everything the threads share. Cheap to clone (all handles).
#[derive(Clone, Debug)]
pub struct EngineContext {
    commands: Arc<CommandQueue>,
    buffer: Arc<TripleBuffer>,
    events: FrameEvents,
    notifier: SceneNotifier,
}

impl EngineContext {
    /// Builds the shared state from configuration.
    ///
    /// # Panics
    ///
    /// Panics if `command_queue_capacity` is zero
    /// (rejected by [`EngineConfig::validate`]).
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let buffer = Arc::new(TripleBuffer::with_fence_wait_timeout(config.fence_wait_timeout()));
        Self {
            commands: Arc::new(CommandQueue::new(config.command_queue_capacity)),
            notifier: SceneNotifier::new(Arc::clone(&buffer)),
            buffer,
            events: FrameEvents::new(config.frame_event_capacity),
        }
    }

    /// Work for the graphics thread goes here.
    #[must_use]
    pub fn commands(&self) -> &Arc<CommandQueue> {
        &self.commands
    }

    /// The scene-state handoff.
    #[must_use]
    pub fn buffer(&self) -> &Arc<TripleBuffer> {
        &self.buffer
    }

    /// Draw results.
    #[must_use]
    pub fn frame_events(&self) -> &FrameEvents {
        &self.events
    }

    /// Scene event entry point.
    #[must_use]
    pub fn notifier(&self) -> &SceneNotifier {
        &self.notifier
    }
}

/// A configured, not yet running engine.
pub struct Engine<B, S, V = AllVisible> {
    config: EngineConfig,
    context: EngineContext,
    backend: B,
    scene: S,
    visibility: V,
}

impl<B: GraphicsBackend, S: Scene> Engine<B, S> {
    /// Creates an engine with no visibility culling.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if `config` fails validation.
    pub fn new(config: EngineConfig, backend: B, scene: S) -> SyncResult<Self> {
        // Before building the context: a zero capacity would panic there
        config.validate()?;
        let context = EngineContext::new(&config);
        Self::from_context(config, context, backend, scene)
    }

    /// Creates an engine over a context built beforehand, so collaborators
    /// constructed before the engine can hold its handles.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if `config` fails validation.
    pub fn from_context(config: EngineConfig, context: EngineContext, backend: B, scene: S) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            context,
            backend,
            scene,
            visibility: AllVisible,
        })
    }
}

impl<B: GraphicsBackend, S: Scene, V: Visibility> Engine<B, S, V> {
    /// Replaces the visibility query.
    #[must_use]
    pub fn with_visibility<W: Visibility>(self, visibility: W) -> Engine<B, S, W> {
        Engine {
            config: self.config,
            context: self.context,
            backend: self.backend,
            scene: self.scene,
            visibility,
        }
    }

    /// Shared context, usable before `start` to queue commands and events.
    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Starts the scheduler threads.
    ///
    /// # Errors
    ///
    /// [`SyncError::ContextInit`] if the graphics context cannot be created,
    /// [`SyncError::ThreadSpawn`] if a thread cannot be started. Both are
    /// fatal; nothing is left running.
    pub fn start(self) -> SyncResult<EngineHandle> {
        let Self {
            config,
            context,
            backend,
            scene,
            visibility,
        } = self;
        let renderer = Renderer::new(backend, &context, config.fences.clone());

        let (simulation, graphics) = match config.threading {
            ThreadingMode::Multi => {
                let mut graphics =
                    TimeStepThread::new(config.graphics.clone(), GraphicsTask::new(renderer)).spawn()?;
                if let Err(e) = graphics.wait_running(config.context_init_timeout()) {
                    abandon(&mut graphics, config.shutdown_timeout());
                    return Err(startup_error(e));
                }

                let task =
                    SimulationTask::<S, V, B>::new(scene, visibility, Arc::clone(context.buffer()));
                let simulation = match TimeStepThread::new(config.simulation.clone(), task).spawn() {
                    Ok(handle) => handle,
                    Err(e) => {
                        abandon(&mut graphics, config.shutdown_timeout());
                        return Err(e);
                    }
                };
                (simulation, Some(graphics))
            }
            ThreadingMode::Single => {
                let task = SimulationTask::single_threaded(
                    scene,
                    visibility,
                    Arc::clone(context.buffer()),
                    renderer,
                );
                let mut simulation = TimeStepThread::new(config.simulation.clone(), task).spawn()?;
                if let Err(e) = simulation.wait_running(config.context_init_timeout()) {
                    abandon(&mut simulation, config.shutdown_timeout());
                    return Err(startup_error(e));
                }
                (simulation, None)
            }
        };

        tracing::info!("engine started ({:?})", config.threading);
        Ok(EngineHandle {
            mode: config.threading,
            shutdown_timeout: config.shutdown_timeout(),
            context,
            simulation,
            graphics,
        })
    }
}

/// Stops a scheduler that is no longer wanted after a failed start.
fn abandon(handle: &mut SchedulerHandle, timeout: std::time::Duration) {
    handle.request_stop();
    // Its own init error or panic is already being reported
    if let Err(e @ SyncError::JoinTimeout { .. }) = handle.join_timeout(timeout) {
        tracing::warn!("{} after failed start: {}", handle.control().name(), e);
    }
}

/// A context that panicked, or neither came up nor failed in time, is a
/// context failure.
fn startup_error(error: SyncError) -> SyncError {
    match error {
        SyncError::Timeout => SyncError::ContextInit("graphics context did not come up in time".into()),
        SyncError::Disconnected => SyncError::ContextInit("graphics thread exited during init".into()),
        SyncError::ThreadPanicked { message, .. } => SyncError::ContextInit(message),
        other => other,
    }
}

/// A running engine.
#[derive(Debug)]
pub struct EngineHandle {
    mode: ThreadingMode,
    shutdown_timeout: std::time::Duration,
    context: EngineContext,
    simulation: SchedulerHandle,
    graphics: Option<SchedulerHandle>,
}

impl EngineHandle {
    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Threading mode the engine runs in.
    #[must_use]
    pub fn mode(&self) -> ThreadingMode {
        self.mode
    }

    /// Simulation iterations so far.
    #[must_use]
    pub fn simulation_cycles(&self) -> u64 {
        self.simulation.cycles()
    }

    /// Graphics iterations so far (equal to simulation cycles in single mode).
    #[must_use]
    pub fn graphics_cycles(&self) -> u64 {
        self.graphics
            .as_ref()
            .map_or_else(|| self.simulation.cycles(), SchedulerHandle::cycles)
    }

    /// Lifecycle of the simulation scheduler.
    #[must_use]
    pub fn simulation_state(&self) -> SchedulerState {
        self.simulation.state()
    }

    /// Lifecycle of the graphics scheduler (the simulation's in single mode).
    #[must_use]
    pub fn graphics_state(&self) -> SchedulerState {
        self.graphics
            .as_ref()
            .map_or_else(|| self.simulation.state(), SchedulerHandle::state)
    }

    /// Returns true once every scheduler thread has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.simulation.is_finished() && self.graphics.as_ref().map_or(true, SchedulerHandle::is_finished)
    }

    /// Stops simulation, then graphics, each within the shutdown budget.
    ///
    /// # Errors
    ///
    /// The first failure among the two joins (timeout, panic, or the loop's
    /// own error). Graphics is still stopped if simulation fails to.
    pub fn shutdown(mut self) -> SyncResult<()> {
        tracing::info!("engine shutting down");

        self.simulation.request_stop();
        let simulation = self.simulation.join_timeout(self.shutdown_timeout);
        if let Err(e) = &simulation {
            tracing::error!("simulation shutdown: {}", e);
        }

        let graphics = match self.graphics.as_mut() {
            Some(graphics) => {
                graphics.request_stop();
                let result = graphics.join_timeout(self.shutdown_timeout);
                if let Err(e) = &result {
                    tracing::error!("graphics shutdown: {}", e);
                }
                result
            }
            None => Ok(()),
        };

        tracing::info!("engine stopped");
        simulation.and(graphics)
    }
}
