//! Raw MIDI message shared by every transport
//!
//! A message is the byte sequence exactly as it travels on the wire (status byte
//! first, SysEx including its `F0 ... F7` framing) plus the logical port it was
//! seen on. Transports decode their native events into this form and encode it
//! back out; nothing in the bridge interprets the bytes.

use std::fmt;

/// Largest message any transport will read or forward (bytes)
///
/// Bounds the UDP datagram read buffer and the real-time event slots.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Status byte that opens a System Exclusive message
pub const SYSEX_START: u8 = 0xF0;

/// Immutable MIDI byte sequence tagged with its logical port
#[derive(Clone, PartialEq, Eq)]
pub struct RawMidiMessage {
    bytes: Box<[u8]>,
    port: usize,
}

impl RawMidiMessage {
    /// Create a message from raw bytes on a 0-based port
    pub fn new(bytes: impl Into<Box<[u8]>>, port: usize) -> Self {
        Self {
            bytes: bytes.into(),
            port,
        }
    }

    /// Raw MIDI bytes
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Logical port index (0-based)
    #[inline]
    pub fn port(&self) -> usize {
        self.port
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether this is a System Exclusive message
    pub fn is_sysex(&self) -> bool {
        self.bytes.first() == Some(&SYSEX_START)
    }
}

impl fmt::Debug for RawMidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawMidiMessage {{ port: {}, bytes: [", self.port)?;
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, "] }}")
    }
}
