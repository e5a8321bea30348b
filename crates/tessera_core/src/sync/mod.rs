//! # Simulation → Graphics Handoff
//!
//! ## The Problem
//!
//! ```text
//! Simulation thread:  WRITES the next snapshot
//! Graphics thread:    READS the last snapshot, for as long as the draw takes
//!
//! Double buffering:   the swap must wait until the reader lets go
//!                     → a slow frame stalls the simulation
//! ```
//!
//! ## The Solution: Triple Buffering
//!
//! ```text
//! commit while the reader is idle:   WRITE → READ,  free slot → WRITE
//! commit while the reader is busy:   WRITE → SPARE (parked), SPARE → WRITE
//! reader lets go, SPARE is parked:   READ ↔ SPARE
//! ```
//!
//! The producer always has a slot to write into. The consumer always has a
//! complete snapshot to read. Role rotation is the atomicity boundary.

mod triple_buffer;

pub use triple_buffer::{ReadGuard, SlotRoles, TripleBuffer, TripleBufferStats, WriteGuard};
