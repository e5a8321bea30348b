//! # Synchronization Error Types
//!
//! All recoverable errors the frame synchronization core can report.
//!
//! Off-thread graphics calls are NOT in here. They are programming defects
//! and panic at the call site.

use thiserror::Error;

/// Errors that can occur in the frame synchronization core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The command queue was closed before the work could be submitted.
    #[error("command queue is closed")]
    QueueClosed,

    /// The command was dropped without running (queue torn down).
    #[error("command was dropped before it produced a result")]
    Disconnected,

    /// The command ran and failed. Carries the panic or error message.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Waiting on a future or fence exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// A singleton action was requested that was never registered.
    #[error("unknown singleton action: {0}")]
    UnknownAction(String),

    /// The native graphics context could not be created. Fatal.
    #[error("graphics context initialization failed: {0}")]
    ContextInit(String),

    /// A scheduler thread could not be started. Fatal.
    #[error("failed to start thread: {0}")]
    ThreadSpawn(String),

    /// A scheduler thread did not terminate within the shutdown budget.
    #[error("thread '{thread}' did not stop in time")]
    JoinTimeout {
        /// Name of the thread that failed to stop.
        thread: String,
    },

    /// A scheduler thread panicked instead of returning.
    #[error("thread '{thread}' panicked: {message}")]
    ThreadPanicked {
        /// Name of the thread.
        thread: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true for errors that leave the engine without a usable
    /// graphics context or thread.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContextInit(_) | Self::ThreadSpawn(_))
    }
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
