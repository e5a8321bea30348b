//! # TESSERA
//!
//! The engine loop on top of [`tessera_core`].
//!
//! ## Threads
//!
//! ```text
//! ┌──────────────┐  commit   ┌──────────────┐  start_read  ┌──────────────┐
//! │  Simulation  │ ────────> │ TripleBuffer │ ───────────> │   Graphics   │──> backend
//! └──────────────┘           └──────────────┘              └──────────────┘
//!        ^                                                        ^
//!        │ SceneEvent (deferred)              CommandQueue (drain) │
//!        └──────────────────── any thread ────────────────────────┘
//! ```
//!
//! In single-threaded mode the simulation thread is also the graphics
//! thread and draws right after each commit.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera::{Engine, HeadlessBackend, MovingEntityScene};
//! use tessera_core::EngineConfig;
//!
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     HeadlessBackend::new(),
//!     MovingEntityScene::new(1, [1.0, 0.0, 0.0]),
//! )?;
//! let handle = engine.start()?;
//! handle.context().commands().execute_blocking(|| { /* on the graphics thread */ })?;
//! handle.shutdown()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod engine;
pub mod events;
pub mod notify;
pub mod renderer;
pub mod scene;
pub mod tasks;

pub use backend::{DrawResult, GraphicsBackend, HeadlessBackend, HeadlessConfig};
pub use engine::{Engine, EngineContext, EngineHandle};
pub use events::{FrameEvent, FrameEvents};
pub use notify::{SceneEvent, SceneNotifier, REBUFFER_ENTITIES};
pub use renderer::Renderer;
pub use scene::{AllVisible, MovingEntityScene, Scene, Visibility, FOLLOW_DISTANCE};
pub use tasks::{GraphicsTask, SimulationTask};
