//! Real-time block processing
//!
//! [`BlockProcessor`] is the body of the audio callback, independent of the
//! audio backend. Per block the backend calls:
//!
//! 1. `begin_block` with the engine frame time and block size
//! 2. `capture` for every inbound MIDI event
//! 3. `render` for every output port
//! 4. `end_block`, which wakes the capture thread if anything came in
//!
//! Nothing here allocates, locks or logs.

use std::sync::Arc;

use super::capture::Waker;
use super::clock::{block_offset, FrameClock};
use super::ring::{EventReader, EventRing, EventWriter, HEADER_SIZE};
use crate::message::MAX_MESSAGE_SIZE;

/// Events each ring is sized for, per port
pub const RING_EVENTS_PER_PORT: usize = 1024;

/// Average payload assumed when sizing rings
const RING_AVG_EVENT_SIZE: usize = 16;

/// Ring byte capacity for `ports` ports; always fits one maximal message
pub fn ring_capacity(ports: usize) -> usize {
    EventRing::capacity_for(RING_EVENTS_PER_PORT * ports, RING_AVG_EVENT_SIZE)
        .max(HEADER_SIZE + MAX_MESSAGE_SIZE)
}

/// Real-time side of the transport
pub struct BlockProcessor {
    inbound: EventWriter,
    outbound: Vec<EventReader>,
    clock: Arc<FrameClock>,
    waker: Arc<Waker>,
    scratch: Box<[u8]>,
    block_start: u64,
    n_frames: u32,
    captured: bool,
    dropped_inbound: u64,
    dropped_outbound: u64,
}

/// Non-real-time ends of the rings created with a [`BlockProcessor`]
pub struct BlockEndpoints {
    /// Inbound events for the capture thread
    pub inbound: EventReader,
    /// One outbound writer per port
    pub outbound: Vec<EventWriter>,
}

impl BlockProcessor {
    /// Build the processor and the rings it shares with other threads
    pub fn new(num_ports: usize, clock: Arc<FrameClock>, waker: Arc<Waker>) -> (Self, BlockEndpoints) {
        let (inbound_writer, inbound_reader) = EventRing::with_capacity(ring_capacity(num_ports));
        let (outbound_writers, outbound_readers): (Vec<_>, Vec<_>) = (0..num_ports)
            .map(|_| EventRing::with_capacity(ring_capacity(1)))
            .unzip();

        let processor = Self {
            inbound: inbound_writer,
            outbound: outbound_readers,
            clock,
            waker,
            scratch: vec![0u8; MAX_MESSAGE_SIZE].into_boxed_slice(),
            block_start: 0,
            n_frames: 0,
            captured: false,
            dropped_inbound: 0,
            dropped_outbound: 0,
        };
        let endpoints = BlockEndpoints {
            inbound: inbound_reader,
            outbound: outbound_writers,
        };
        (processor, endpoints)
    }

    pub fn num_ports(&self) -> usize {
        self.outbound.len()
    }

    /// Start a block at engine frame time `last_frame_time`
    pub fn begin_block(&mut self, last_frame_time: u32, n_frames: u32) {
        self.block_start = self.clock.publish(last_frame_time);
        self.n_frames = n_frames;
        self.captured = false;
    }

    /// Queue one inbound event at `offset` frames into the block
    ///
    /// Returns `false` if the inbound ring is full and the event was dropped.
    pub fn capture(&mut self, port: usize, offset: u32, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let time = self.block_start + offset as u64;
        if self.inbound.write(port, time, bytes) {
            self.captured = true;
            true
        } else {
            self.dropped_inbound += 1;
            false
        }
    }

    /// Drain the due events of `port`'s outbound ring into the block through `write`
    ///
    /// Draining stops at the first event stamped after the block start; it
    /// stays queued for a later block. `write(frame, bytes)` returns `false`
    /// when the backend cannot take the event; it is dropped. Returns the
    /// number of events written.
    pub fn render<F>(&mut self, port: usize, mut write: F) -> usize
    where
        F: FnMut(u32, &[u8]) -> bool,
    {
        let Some(reader) = self.outbound.get_mut(port) else {
            return 0;
        };
        let mut written = 0;
        while let Some(header) = reader.peek() {
            let Some(frame) = block_offset(self.block_start, header.time, self.n_frames) else {
                break;
            };
            if frame >= self.n_frames || header.size > self.scratch.len() {
                reader.skip();
                self.dropped_outbound += 1;
                continue;
            }
            reader.read_into(&mut self.scratch);
            if write(frame, &self.scratch[..header.size]) {
                written += 1;
            } else {
                self.dropped_outbound += 1;
            }
        }
        written
    }

    /// Finish the block; wakes the capture thread if anything was captured
    pub fn end_block(&mut self) -> bool {
        if self.captured {
            self.waker.try_wake();
        }
        self.captured
    }

    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound
    }

    pub fn dropped_outbound(&self) -> u64 {
        self.dropped_outbound
    }
}
