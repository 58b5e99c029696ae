//! Transport abstraction shared by the network, sequencer and JACK adapters
//!
//! Every transport both produces and consumes [`RawMidiMessage`]s:
//!
//! ```text
//! medium ──► listener/capture thread ──► Observers::emit ──► router ──► other.receive()
//!                                                                         │
//! medium ◄──────────────────── encode/transmit ◄──── send_data() ◄────────┘
//! ```
//!
//! Delivery is a direct call on the producing thread; there is no dispatch
//! thread. `send_data`/`receive` must therefore be callable concurrently from
//! several other transports' threads and must never block for unbounded time.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::message::RawMidiMessage;

/// The three MIDI carrying mediums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// UDP/IP multicast
    Network,
    /// ALSA sequencer
    Sequencer,
    /// JACK MIDI (real-time audio graph)
    Realtime,
}

impl TransportKind {
    /// Fixed open order used by the device manager
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Network,
        TransportKind::Sequencer,
        TransportKind::Realtime,
    ];

    /// Human readable subsystem name
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Network => "Network",
            TransportKind::Sequencer => "ALSA MIDI",
            TransportKind::Realtime => "JACK MIDI",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of a successful `send_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the medium
    Sent,
    /// Accepted but discarded because a bounded buffer was full
    Dropped,
}

/// Subscriber invoked for every message a transport receives from its medium
pub type ReceiveCallback = Arc<dyn Fn(&RawMidiMessage) + Send + Sync>;

/// Handler invoked when a transport dies on its own (e.g. JACK server shutdown)
pub type DeviceLostCallback = Arc<dyn Fn(TransportKind) + Send + Sync>;

/// A MIDI transport adapter
///
/// All methods take `&self`: transports are shared behind `Arc` between the
/// manager, the router wiring and their own worker threads.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Acquire kernel resources and start the worker thread.
    ///
    /// Closes first if already open. On error the transport is left fully closed.
    fn open(&self, config: &BridgeConfig) -> Result<()>;

    /// Release everything. Idempotent; `open` may be called again right after.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Encode and transmit one message on `message.port()`
    fn send_data(&self, message: &RawMidiMessage) -> Result<SendOutcome>;

    /// Inbound entry point used by the router
    ///
    /// Per-message failures are transient: they are logged and the message is lost.
    fn receive(&self, message: &RawMidiMessage) {
        match self.send_data(message) {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Dropped) => {
                log::trace!("[{}] Dropped {:?} (buffer full)", self.kind(), message);
            }
            Err(e) => {
                log::warn!("[{}] Send failed on port {}: {}", self.kind(), message.port(), e);
            }
        }
    }

    /// Register a callback for messages received from this transport's medium
    fn subscribe(&self, callback: ReceiveCallback);

    /// Drop every registered receive callback
    fn unsubscribe_all(&self);

    /// Register the device-lost handler. Only transports that can die on their
    /// own override this.
    fn set_device_lost_handler(&self, _handler: DeviceLostCallback) {}
}

/// Check a message against the send boundary invariants
pub fn validate_outbound(message: &RawMidiMessage, num_ports: usize, max_len: usize) -> Result<()> {
    if message.port() >= num_ports {
        return Err(Error::InvalidPort {
            port: message.port(),
            num_ports,
        });
    }
    if message.is_empty() {
        return Err(Error::EmptyMessage);
    }
    if message.len() > max_len {
        return Err(Error::MessageTooLarge {
            len: message.len(),
            max: max_len,
        });
    }
    Ok(())
}

/// Copy-on-write list of receive callbacks
///
/// `emit` clones the current snapshot out of the lock before calling anything,
/// so no lock is held while a callback runs into another transport.
#[derive(Default)]
pub struct Observers {
    callbacks: Mutex<Arc<Vec<ReceiveCallback>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arc<Vec<ReceiveCallback>>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, callback: ReceiveCallback) {
        let mut guard = self.lock();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(callback);
        *guard = Arc::new(next);
    }

    pub fn clear(&self) {
        *self.lock() = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a received message to every subscriber
    pub fn emit(&self, message: &RawMidiMessage) {
        let snapshot = self.lock().clone();
        for callback in snapshot.iter() {
            callback(message);
        }
    }
}
