//! Real-time (JACK) transport
//!
//! ```text
//! process() ──► BlockProcessor::capture ──► inbound ring ──► capture thread
//!                                                               │ ReorderQueue
//!                                                               ▼
//!                                                          Observers::emit
//!
//! send_data() ──► per-port outbound ring ──► BlockProcessor::render ──► out_{i+1}
//! ```
//!
//! Everything except the JACK client glue is backend-agnostic and always built.

pub mod capture;
pub mod clock;
pub mod engine;
pub mod queue;
pub mod ring;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
mod client;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub use client::RealtimeTransport;

pub use capture::{Capture, Waker};
pub use clock::{block_offset, FrameClock};
pub use engine::{BlockEndpoints, BlockProcessor};
pub use queue::{QueuedEvent, ReorderQueue};
pub use ring::{EventHeader, EventReader, EventRing, EventWriter};
