//! Audio frame clock shared between the real-time callback and other threads
//!
//! The callback publishes the engine's 32-bit frame time at the start of each
//! block. It is extended to 64 bits across wrap-around and stamped with a
//! monotonic instant, so a non-real-time thread can estimate "now" in frames.
//! Publication uses a sequence counter: the writer never waits, readers retry
//! on a torn read.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct FrameClock {
    epoch: Instant,
    /// Odd while a publish is in progress
    version: AtomicU64,
    frames: AtomicU64,
    /// Nanoseconds since `epoch` at the last publish
    stamp_nanos: AtomicU64,
    sample_rate: AtomicU32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            epoch: Instant::now(),
            version: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            stamp_nanos: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
        }
    }

    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Publish the block start frame time; returns it extended to 64 bits
    ///
    /// Called only from the real-time thread.
    pub fn publish(&self, frame_time: u32) -> u64 {
        let previous = self.frames.load(Ordering::Relaxed);
        let mut extended = (previous & !0xFFFF_FFFF) | frame_time as u64;
        if extended < previous {
            extended += 1 << 32;
        }
        let nanos = self.epoch.elapsed().as_nanos() as u64;

        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.frames.store(extended, Ordering::Relaxed);
        self.stamp_nanos.store(nanos, Ordering::Relaxed);
        self.version.store(v.wrapping_add(2), Ordering::Release);
        extended
    }

    fn snapshot(&self) -> (u64, u64) {
        loop {
            let before = self.version.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frames = self.frames.load(Ordering::Relaxed);
            let nanos = self.stamp_nanos.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == before {
                return (frames, nanos);
            }
        }
    }

    /// Frame time at the start of the last published block
    pub fn last_frame_time(&self) -> u64 {
        self.snapshot().0
    }

    /// Estimated current frame time
    pub fn now(&self) -> u64 {
        let (frames, stamp) = self.snapshot();
        let rate = self.sample_rate() as u64;
        if rate == 0 {
            return frames;
        }
        let now_nanos = self.epoch.elapsed().as_nanos() as u64;
        let elapsed = now_nanos.saturating_sub(stamp);
        frames + (elapsed as u128 * rate as u128 / 1_000_000_000) as u64
    }

    /// Wall time spanned by `frames` at the current sample rate
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        let rate = self.sample_rate() as u64;
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((frames as u128 * 1_000_000_000 / rate as u128) as u64)
    }
}

/// Frame within the current block at which to emit an outbound event
///
/// Events are played one block late: `offset = last_frame_time - event_time`
/// maps to `n_frames - offset`, clamped to the last frame of the block. An
/// event more than one block old goes out at frame 0. An event stamped after
/// `last_frame_time` is not due yet and returns `None`; it waits for a later block.
pub fn block_offset(last_frame_time: u64, event_time: u64, n_frames: u32) -> Option<u32> {
    if event_time > last_frame_time {
        return None;
    }
    let offset = last_frame_time - event_time;
    if offset > n_frames as u64 {
        Some(0)
    } else {
        Some((n_frames - offset as u32).min(n_frames.saturating_sub(1)))
    }
}
