//! Run-flagged worker thread
//!
//! Each transport owns one non-real-time worker (network listener, sequencer
//! listener, JACK capture thread). Shutdown order is always: clear the run
//! flag, wake the thread out of its wait, join with a bound, then release the
//! kernel resources the thread may still be touching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;

/// How often a stopping thread is re-woken while we wait for it
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Worker thread handle
///
/// Owns the join handle and the run flag. Dropping it stops the thread with
/// [`DEFAULT_JOIN_TIMEOUT`].
pub struct WorkerThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

/// Bounded wait used when a worker is dropped without an explicit stop
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(1200);

impl WorkerThread {
    /// Spawn a named worker. The body receives the run flag and must return
    /// soon after it reads `false`.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))?;

        Ok(Self {
            running,
            handle: Some(handle),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the run flag is still set
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Clear the run flag without waiting
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop the thread, calling `wake` until it exits or `timeout` elapses.
    ///
    /// Returns `true` if the thread was joined. A thread that does not exit in
    /// time is detached and keeps only the resources it holds by `Arc`.
    pub fn stop(&mut self, timeout: Duration, wake: &dyn Fn()) -> bool {
        self.request_stop();

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "[{}] Worker did not stop within {:?}, detaching",
                    self.name,
                    timeout
                );
                return false;
            }
            wake();
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if handle.join().is_err() {
            log::error!("[{}] Worker panicked", self.name);
        }
        log::debug!("[{}] Worker stopped", self.name);
        true
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop(DEFAULT_JOIN_TIMEOUT, &|| {});
        }
    }
}
