//! # TESSERA Core
//!
//! The frame synchronization kernel: everything that sits between the
//! simulation thread and the one thread that owns the native graphics context.
//!
//! ## The Problem
//!
//! ```text
//! Simulation thread:  WRITES the scene state every cycle
//! Graphics thread:    READS the scene state, talks to the driver
//!
//! Without synchronization: TORN SNAPSHOTS
//! With one big Mutex:      SIMULATION WAITS FOR THE DRIVER
//! ```
//!
//! ## The Solution
//!
//! ```text
//!   Simulation ──> [WRITE] ──commit──> [READ] ──> Graphics ──> Driver
//!                     ^                   │
//!                     └──── [SPARE] <─────┘   (reclaimed once its fence signals)
//!
//!   Any thread ──> [CommandQueue] ──drain──> Graphics thread
//! ```
//!
//! - [`TripleBuffer`]: three snapshots, rotating roles, never blocks either side
//! - [`CommandQueue`]: the only sanctioned way to touch the graphics context
//! - [`GpuCommandSync`] / [`FenceTracker`]: driver-completion bookkeeping
//! - [`TimeStepThread`]: capped-cadence loop with sleep-then-spin pacing
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::TripleBuffer;
//!
//! let buffer = TripleBuffer::new();
//!
//! // Simulation thread
//! let mut write = buffer.begin_write();
//! write.set_camera(camera);
//! write.commit();
//!
//! // Graphics thread
//! let read = buffer.start_read();
//! draw(read.state());
//! read.finish();
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod command;
pub mod config;
pub mod error;
pub mod fence;
pub mod scheduler;
pub mod state;
pub mod sync;

pub use command::{CommandFuture, CommandQueue, DrainReport, QueueStats};
pub use config::{EngineConfig, FenceConfig, SchedulerConfig, ThreadingMode};
pub use error::{SyncError, SyncResult};
pub use fence::{FenceSignal, FenceStats, FenceTracker, GpuCommandSync};
pub use scheduler::{
    FramePacer, SchedulerControl, SchedulerHandle, SchedulerState, SleepSpinPacer, TimeStepTask,
    TimeStepThread,
};
pub use state::{
    BufferHandle, CameraData, DirectionalLight, EntityInstance, PointLight, RenderState,
    StateCommand,
};
pub use sync::{ReadGuard, SlotRoles, TripleBuffer, TripleBufferStats, WriteGuard};
