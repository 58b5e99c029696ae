//! Framed MIDI event ring over a lock-free byte ring
//!
//! Each event is a fixed header followed by its payload:
//!
//! ```text
//! | port: u16 | size: u16 | time: u64 | payload (size bytes) |
//! ```
//!
//! The writer commits header and payload in one chunk, so the reader never
//! sees half an event. Neither side allocates or blocks after construction.

use rtrb::{Consumer, Producer, RingBuffer};

/// Bytes in an event header
pub const HEADER_SIZE: usize = 12;

/// Header of one queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub port: usize,
    pub time: u64,
    pub size: usize,
}

impl EventHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&(self.port as u16).to_le_bytes());
        out[2..4].copy_from_slice(&(self.size as u16).to_le_bytes());
        out[4..12].copy_from_slice(&self.time.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let port = u16::from_le_bytes([raw[0], raw[1]]) as usize;
        let size = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        let mut time = [0u8; 8];
        time.copy_from_slice(&raw[4..12]);
        Self {
            port,
            time: u64::from_le_bytes(time),
            size,
        }
    }
}

/// Framed event ring; `with_capacity` returns its two halves
pub struct EventRing;

impl EventRing {
    /// `capacity` counts header and payload bytes
    pub fn with_capacity(capacity: usize) -> (EventWriter, EventReader) {
        let (producer, consumer) = RingBuffer::new(capacity);
        (EventWriter { producer }, EventReader { consumer })
    }

    /// Byte capacity for `events` events of `avg_size` payload bytes
    pub fn capacity_for(events: usize, avg_size: usize) -> usize {
        events * (HEADER_SIZE + avg_size)
    }
}

/// Producer half
pub struct EventWriter {
    producer: Producer<u8>,
}

impl EventWriter {
    /// Queue one event. Returns `false` (event dropped) if it does not fit.
    pub fn write(&mut self, port: usize, time: u64, bytes: &[u8]) -> bool {
        if bytes.len() > u16::MAX as usize || port > u16::MAX as usize {
            return false;
        }
        let total = HEADER_SIZE + bytes.len();
        let Ok(mut chunk) = self.producer.write_chunk(total) else {
            return false;
        };

        let header = EventHeader {
            port,
            time,
            size: bytes.len(),
        }
        .encode();
        let (first, second) = chunk.as_mut_slices();
        copy_split(&header, bytes, first, second);
        chunk.commit_all();
        true
    }

    /// Free bytes
    pub fn available(&self) -> usize {
        self.producer.slots()
    }
}

/// Copy `a` then `b` into the two halves of a ring chunk
fn copy_split(a: &[u8], b: &[u8], first: &mut [u8], second: &mut [u8]) {
    let dst = first.iter_mut().chain(second.iter_mut());
    for (slot, byte) in dst.zip(a.iter().chain(b.iter())) {
        *slot = *byte;
    }
}

/// Consumer half
pub struct EventReader {
    consumer: Consumer<u8>,
}

impl EventReader {
    /// Header of the next event, without consuming it
    pub fn peek(&mut self) -> Option<EventHeader> {
        let chunk = self.consumer.read_chunk(HEADER_SIZE).ok()?;
        let (first, second) = chunk.as_slices();
        let mut raw = [0u8; HEADER_SIZE];
        for (slot, byte) in raw.iter_mut().zip(first.iter().chain(second.iter())) {
            *slot = *byte;
        }
        // Dropping an uncommitted chunk leaves the data in place
        Some(EventHeader::decode(&raw))
    }

    /// Consume the next event, copying up to `buf.len()` payload bytes
    pub fn read_into(&mut self, buf: &mut [u8]) -> Option<EventHeader> {
        let header = self.peek()?;
        let chunk = self.consumer.read_chunk(HEADER_SIZE + header.size).ok()?;
        let (first, second) = chunk.as_slices();
        let payload = first.iter().chain(second.iter()).skip(HEADER_SIZE);
        for (slot, byte) in buf.iter_mut().zip(payload) {
            *slot = *byte;
        }
        chunk.commit_all();
        Some(header)
    }

    /// Consume and discard the next event
    pub fn skip(&mut self) -> Option<EventHeader> {
        let header = self.peek()?;
        let chunk = self.consumer.read_chunk(HEADER_SIZE + header.size).ok()?;
        chunk.commit_all();
        Some(header)
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }
}
