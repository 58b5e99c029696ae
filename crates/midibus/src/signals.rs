//! SIGINT/SIGTERM delivered as channel messages
//!
//! The signals are blocked process-wide and collected by one thread with
//! `sigwait`, so shutdown runs on the main thread. Call before spawning any
//! other thread so every thread inherits the mask.

use std::io;
use std::thread;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver};

pub fn spawn() -> Result<Receiver<i32>> {
    // SAFETY: sigset_t is plain data; the libc calls only initialise it.
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
    }

    // SAFETY: set is initialised; old mask not requested.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc)).context("Failed to block termination signals");
    }

    let (tx, rx) = channel::bounded(1);
    thread::Builder::new()
        .name("midibus-signals".into())
        .spawn(move || loop {
            let mut signal: libc::c_int = 0;
            // SAFETY: set stays valid for the life of this thread.
            if unsafe { libc::sigwait(&set, &mut signal) } == 0 {
                let _ = tx.send(signal);
                return;
            }
        })
        .context("Failed to spawn signal thread")?;

    Ok(rx)
}
