//! Capture thread: inbound ring -> reorder queue -> observers
//!
//! The real-time callback only ever `try_wake`s this thread. A wake-up lost to
//! lock contention is picked up by the timed wait. Besides its own run flag
//! the thread watches the transport's `closed` flag, so it also exits when the
//! engine shuts down underneath it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use super::clock::FrameClock;
use super::queue::ReorderQueue;
use super::ring::EventReader;
use crate::error::Result;
use crate::message::RawMidiMessage;
use crate::transport::Observers;
use crate::worker::WorkerThread;

/// Upper bound on one wait for a wake-up
pub const CAPTURE_WAIT: Duration = Duration::from_millis(100);

/// Step used while pacing an event whose time has not come yet
const PACING_STEP: Duration = Duration::from_millis(1);

/// Longest an event is held back for pacing
const MAX_PACING: Duration = Duration::from_millis(50);

/// Wake flag guarded by a mutex + condvar
#[derive(Default)]
pub struct Waker {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Waker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking wake for the real-time thread
    ///
    /// Returns `false` if the lock was contended; the waiter's timeout covers it.
    pub fn try_wake(&self) -> bool {
        let mut pending = match self.pending.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        *pending = true;
        self.cond.notify_one();
        true
    }

    /// Blocking wake for non-real-time callers (shutdown)
    pub fn wake(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_one();
    }

    /// Wait for a wake-up or `timeout`; returns whether a wake was pending
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *pending, false)
    }
}

/// State owned by the capture thread
pub struct Capture {
    reader: EventReader,
    queue: ReorderQueue,
    clock: Arc<FrameClock>,
    observers: Arc<Observers>,
    dropped: u64,
}

impl Capture {
    pub fn new(
        reader: EventReader,
        queue: ReorderQueue,
        clock: Arc<FrameClock>,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            reader,
            queue,
            clock,
            observers,
            dropped: 0,
        }
    }

    /// Move everything from the inbound ring into the reorder queue
    pub fn drain_ring(&mut self) -> usize {
        let mut moved = 0;
        while let Some(header) = self.reader.peek() {
            match self.queue.push(header.port, header.time, header.size) {
                Some(slot) => {
                    self.reader.read_into(slot);
                    moved += 1;
                }
                None => {
                    self.reader.skip();
                    self.dropped += 1;
                }
            }
        }
        moved
    }

    /// Emit queued events in time order, holding each back until its frame
    /// time is reached or `MAX_PACING` has passed
    pub fn deliver(&mut self, running: &AtomicBool) -> usize {
        let mut delivered = 0;
        while let Some(time) = self.queue.peek_time() {
            let held_since = Instant::now();
            while time > self.clock.now()
                && held_since.elapsed() < MAX_PACING
                && running.load(Ordering::Acquire)
            {
                std::thread::sleep(PACING_STEP);
            }
            if !running.load(Ordering::Acquire) {
                break;
            }

            let Some(event) = self.queue.pop() else {
                break;
            };
            let message = RawMidiMessage::new(event.bytes, event.port);
            log::trace!("[JACK] t={} {:?}", event.time, message);
            self.observers.emit(&message);
            delivered += 1;
        }
        // Resets the arena once drained
        if self.queue.is_empty() {
            self.queue.clear();
        }
        delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn run(&mut self, waker: &Waker, running: &AtomicBool, closed: &AtomicBool) {
        let live = || running.load(Ordering::Acquire) && !closed.load(Ordering::Acquire);
        while live() {
            waker.wait(CAPTURE_WAIT);
            if !live() {
                break;
            }
            let before = self.dropped;
            self.drain_ring();
            if !self.queue.is_empty() {
                self.deliver(running);
            }
            if self.dropped > before {
                log::debug!("[JACK] Reorder queue full, dropped {} event(s)", self.dropped - before);
            }
        }
    }
}

/// Start the capture thread; it exits on its own once `closed` is set and woken
pub fn spawn(mut capture: Capture, waker: Arc<Waker>, closed: Arc<AtomicBool>) -> Result<WorkerThread> {
    WorkerThread::spawn("midibus-jack-capture", move |running| {
        capture.run(&waker, &running, &closed);
        log::debug!("[JACK] Capture thread exited ({} dropped)", capture.dropped());
    })
}
