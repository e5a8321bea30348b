//! # Frame Events
//!
//! Graphics thread → anyone. One [`FrameEvent::Drawn`] per renderer cycle.
//!
//! The channel is bounded and sends never block: a slow consumer loses
//! events, the graphics thread never waits for it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::backend::DrawResult;

/// Events published by the renderer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A frame was drawn.
    Drawn(DrawResult),
    /// The graphics context was destroyed. Last event of a run.
    ContextLost,
}

/// Bounded frame-event channel.
#[derive(Clone)]
pub struct FrameEvents {
    sender: Sender<FrameEvent>,
    receiver: Receiver<FrameEvent>,
    dropped: Arc<AtomicU64>,
}

impl FrameEvents {
    /// Creates a channel holding at most `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an event (non-blocking).
    ///
    /// Returns `false` if the channel is full and the event was dropped.
    pub fn publish(&self, event: FrameEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Log the first drop and then every 1024th
                if dropped == 1 || dropped % 1024 == 0 {
                    tracing::warn!("frame event channel full, {} events dropped", dropped);
                }
                false
            }
            // Receiver half lives in self, so this cannot happen
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Returns a receiver for the events.
    #[must_use]
    pub fn receiver(&self) -> Receiver<FrameEvent> {
        self.receiver.clone()
    }

    /// Takes every pending event (non-blocking).
    #[must_use]
    pub fn drain(&self) -> Vec<FrameEvent> {
        self.receiver.try_iter().collect()
    }

    /// Events lost to a full channel.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FrameEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEvents")
            .field("pending", &self.receiver.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
