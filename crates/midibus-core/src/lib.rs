//! midibus-core: a virtual MIDI bus across three transports
//!
//! MIDI traffic seen on one transport is rebroadcast on all the others:
//!
//! - [`net::NetworkTransport`]: UDP multicast, one datagram per message
//! - `seq::SequencerTransport`: ALSA sequencer ports (feature `alsa-seq`, Linux)
//! - `rt::RealtimeTransport`: JACK MIDI ports (feature `jack-backend`, Linux)
//!
//! [`DeviceManager`] opens the enabled transports as one unit and
//! [`TransportRouter`] wires them into a full mesh, so a message received on
//! logical port `i` of one transport goes out on port `i` of every other one.

pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod net;
pub mod router;
pub mod rt;
#[cfg(all(target_os = "linux", feature = "alsa-seq"))]
pub mod seq;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use manager::{DeviceManager, ManagerEvent, MessageHandler, RETRY_INTERVAL};
pub use message::RawMidiMessage;
pub use router::TransportRouter;
pub use transport::{SendOutcome, Transport, TransportKind};
