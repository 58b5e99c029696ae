//! Network listener loop
//!
//! One thread multiplexes every input socket with `poll(2)`. The 1 s timeout
//! bounds how long a stop request can go unnoticed.

use std::io;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::message::{RawMidiMessage, MAX_MESSAGE_SIZE};
use crate::transport::Observers;
use crate::worker::WorkerThread;

/// Poll timeout between run-flag checks
pub const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Spawn the listener over `sockets`; socket `i` carries logical port `i`.
///
/// The thread owns the sockets, so they are closed once it has exited.
pub(crate) fn spawn(sockets: Vec<UdpSocket>, observers: Arc<Observers>) -> Result<WorkerThread> {
    for socket in &sockets {
        socket.set_nonblocking(true)?;
    }
    WorkerThread::spawn("midibus-net", move |running| {
        listen(&sockets, &running, &observers);
        log::debug!("[NET] Listener exited ({} sockets)", sockets.len());
    })
}

fn listen(sockets: &[UdpSocket], running: &AtomicBool, observers: &Observers) {
    let mut fds: Vec<libc::pollfd> = sockets
        .iter()
        .map(|socket| libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    while running.load(Ordering::Acquire) {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }

        // SAFETY: fds is a live, correctly sized pollfd array.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[NET] poll failed: {}", err);
            break;
        }
        if ready == 0 {
            continue;
        }

        for (port, (fd, socket)) in fds.iter().zip(sockets).enumerate() {
            if fd.revents & (libc::POLLIN | libc::POLLERR) == 0 {
                continue;
            }
            drain_socket(socket, port, &mut buf, observers);
        }
    }
}

/// Read every pending datagram from one socket
fn drain_socket(socket: &UdpSocket, port: usize, buf: &mut [u8], observers: &Observers) {
    loop {
        match socket.recv_from(buf) {
            Ok((0, _)) => continue,
            Ok((len, from)) => {
                let message = RawMidiMessage::new(&buf[..len], port);
                log::trace!("[NET] {} -> {:?}", from, message);
                observers.emit(&message);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[NET] recvfrom on port {} failed: {}", port, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn collector() -> (Arc<Observers>, Arc<Mutex<Vec<RawMidiMessage>>>) {
        let observers = Arc::new(Observers::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        observers.subscribe(Arc::new(move |msg: &RawMidiMessage| {
            sink.lock().unwrap().push(msg.clone());
        }));
        (observers, seen)
    }

    fn wait_for(seen: &Mutex<Vec<RawMidiMessage>>, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if seen.lock().unwrap().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_datagram_emitted_with_port_index() {
        let inputs: Vec<UdpSocket> = (0..2)
            .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
            .collect();
        let targets: Vec<_> = inputs.iter().map(|s| s.local_addr().unwrap()).collect();
        let (observers, seen) = collector();

        let mut worker = spawn(inputs, observers).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(&[0x90, 0x40, 0x7F], targets[0]).unwrap();
        peer.send_to(&[0xB1, 0x07, 0x64], targets[1]).unwrap();

        assert!(wait_for(&seen, 2));
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by_key(|m| m.port());
        assert_eq!(seen[0].bytes(), &[0x90, 0x40, 0x7F]);
        assert_eq!(seen[0].port(), 0);
        assert_eq!(seen[1].bytes(), &[0xB1, 0x07, 0x64]);
        assert_eq!(seen[1].port(), 1);

        assert!(worker.stop(Duration::from_millis(1500), &|| {}));
    }

    #[test]
    fn test_sysex_datagram_passes_unmodified() {
        let input = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = input.local_addr().unwrap();
        let (observers, seen) = collector();
        let _worker = spawn(vec![input], observers).unwrap();

        let sysex: Vec<u8> = std::iter::once(0xF0)
            .chain((0..200).map(|i| (i % 0x80) as u8))
            .chain(std::iter::once(0xF7))
            .collect();
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .send_to(&sysex, target)
            .unwrap();

        assert!(wait_for(&seen, 1));
        assert_eq!(seen.lock().unwrap()[0].bytes(), sysex.as_slice());
    }

    #[test]
    fn test_stop_within_poll_timeout() {
        let input = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (observers, _seen) = collector();
        let mut worker = spawn(vec![input], observers).unwrap();

        let started = Instant::now();
        assert!(worker.stop(Duration::from_millis(1500), &|| {}));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }
}
