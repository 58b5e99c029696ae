//! JACK MIDI transport
//!
//! Registers `in_{i+1}` / `out_{i+1}` MIDI ports. The process callback runs a
//! [`BlockProcessor`]; inbound events reach observers through the capture
//! thread, outbound events are queued per port by `send_data` stamped with
//! the estimated current frame time.
//!
//! When the server shuts down the notification handler marks the transport
//! closed, lets the capture thread exit and reports the loss. The dead client
//! is then released on `close` without deactivating it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jack::{Client, ClientOptions, ClientStatus, Control, MidiIn, MidiOut, Port, ProcessScope, RawMidi};

use super::capture::{self, Capture, Waker};
use super::clock::FrameClock;
use super::engine::{ring_capacity, BlockProcessor, RING_EVENTS_PER_PORT};
use super::queue::ReorderQueue;
use super::ring::EventWriter;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::message::{RawMidiMessage, MAX_MESSAGE_SIZE};
use crate::transport::{
    validate_outbound, DeviceLostCallback, Observers, ReceiveCallback, SendOutcome, Transport, TransportKind,
};
use crate::worker::{WorkerThread, DEFAULT_JOIN_TIMEOUT};

type LostSlot = Arc<Mutex<Option<DeviceLostCallback>>>;

/// Real-time process handler
struct Processor {
    block: BlockProcessor,
    inputs: Vec<Port<MidiIn>>,
    outputs: Vec<Port<MidiOut>>,
    closed: Arc<AtomicBool>,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        if self.closed.load(Ordering::Relaxed) {
            return Control::Continue;
        }

        self.block.begin_block(ps.last_frame_time(), ps.n_frames());

        for (port, input) in self.inputs.iter().enumerate() {
            for event in input.iter(ps) {
                self.block.capture(port, event.time, event.bytes);
            }
        }

        for (port, output) in self.outputs.iter_mut().enumerate() {
            let mut writer = output.writer(ps);
            self.block
                .render(port, |time, bytes| writer.write(&RawMidi { time, bytes }).is_ok());
        }

        self.block.end_block();
        Control::Continue
    }
}

/// JACK notification handler
struct Notifications {
    closed: Arc<AtomicBool>,
    /// Set once the server is gone
    server_gone: Arc<AtomicBool>,
    lost: LostSlot,
    clock: Arc<FrameClock>,
    waker: Arc<Waker>,
}

impl jack::NotificationHandler for Notifications {
    fn shutdown(&mut self, _status: ClientStatus, reason: &str) {
        log::warn!("[JACK] Server shut down: {}", reason);
        self.server_gone.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        // Capture thread watches `closed` and exits on this wake
        self.waker.wake();

        let handler = self.lost.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = handler {
            handler(TransportKind::Realtime);
        }
    }

    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        log::info!("[JACK] Sample rate: {}", srate);
        self.clock.set_sample_rate(srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        log::warn!("[JACK] xrun");
        Control::Continue
    }
}

struct Active {
    client: jack::AsyncClient<Notifications, Processor>,
    outbound: Vec<Mutex<EventWriter>>,
    clock: Arc<FrameClock>,
    waker: Arc<Waker>,
    capture: WorkerThread,
    closed: Arc<AtomicBool>,
    server_gone: Arc<AtomicBool>,
}

/// JACK MIDI transport
pub struct RealtimeTransport {
    active: Mutex<Option<Active>>,
    observers: Arc<Observers>,
    lost: LostSlot,
}

impl Default for RealtimeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeTransport {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            observers: Arc::new(Observers::new()),
            lost: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect to a running JACK server and register `num_ports` port pairs
    pub fn open_with(&self, client_name: &str, num_ports: usize) -> Result<()> {
        self.close();

        if num_ports == 0 {
            return Err(Error::InvalidConfig("num_ports must be at least 1".into()));
        }

        let (client, status) = Client::new(client_name, ClientOptions::NO_START_SERVER)?;
        log::info!(
            "[JACK] Client '{}' created (sample rate: {}, buffer size: {}, status: {:?})",
            client.name(),
            client.sample_rate(),
            client.buffer_size(),
            status
        );

        let mut inputs = Vec::with_capacity(num_ports);
        let mut outputs = Vec::with_capacity(num_ports);
        for i in 0..num_ports {
            inputs.push(client.register_port(&format!("in_{}", i + 1), MidiIn::default())?);
            outputs.push(client.register_port(&format!("out_{}", i + 1), MidiOut::default())?);
        }

        let clock = Arc::new(FrameClock::new(client.sample_rate() as u32));
        let waker = Arc::new(Waker::new());
        let closed = Arc::new(AtomicBool::new(false));
        let server_gone = Arc::new(AtomicBool::new(false));

        let (block, endpoints) = BlockProcessor::new(num_ports, clock.clone(), waker.clone());
        let queue = ReorderQueue::with_capacity(RING_EVENTS_PER_PORT * num_ports, ring_capacity(num_ports));
        let capture = Capture::new(endpoints.inbound, queue, clock.clone(), self.observers.clone());
        let mut capture_thread = capture::spawn(capture, waker.clone(), closed.clone())?;

        let processor = Processor {
            block,
            inputs,
            outputs,
            closed: closed.clone(),
        };
        let notifications = Notifications {
            closed: closed.clone(),
            server_gone: server_gone.clone(),
            lost: self.lost.clone(),
            clock: clock.clone(),
            waker: waker.clone(),
        };

        let client = match client.activate_async(notifications, processor) {
            Ok(client) => client,
            Err(e) => {
                let wake = waker.clone();
                capture_thread.stop(DEFAULT_JOIN_TIMEOUT, &move || wake.wake());
                return Err(e.into());
            }
        };

        log::info!("[JACK] Open: {} MIDI port pair(s)", num_ports);
        *self.lock() = Some(Active {
            client,
            outbound: endpoints.outbound.into_iter().map(Mutex::new).collect(),
            clock,
            waker,
            capture: capture_thread,
            closed,
            server_gone,
        });
        Ok(())
    }
}

impl Transport for RealtimeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Realtime
    }

    fn open(&self, config: &BridgeConfig) -> Result<()> {
        self.open_with(&config.client_name, config.num_ports)
    }

    fn close(&self) {
        let Some(mut active) = self.lock().take() else {
            return;
        };
        active.closed.store(true, Ordering::Release);

        let waker = active.waker.clone();
        active.capture.stop(DEFAULT_JOIN_TIMEOUT, &move || waker.wake());

        if active.server_gone.load(Ordering::Acquire) {
            // Nothing to deactivate against; only free the client
            drop(active.client);
            log::info!("[JACK] Released client after server shutdown");
        } else {
            if let Err(e) = active.client.deactivate() {
                log::debug!("[JACK] Deactivate: {}", e);
            }
            log::info!("[JACK] Closed");
        }
    }

    fn is_open(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|active| !active.closed.load(Ordering::Acquire))
    }

    fn send_data(&self, message: &RawMidiMessage) -> Result<SendOutcome> {
        let guard = self.lock();
        let active = guard
            .as_ref()
            .filter(|active| !active.closed.load(Ordering::Acquire))
            .ok_or(Error::NotOpen(TransportKind::Realtime))?;
        validate_outbound(message, active.outbound.len(), MAX_MESSAGE_SIZE)?;

        let time = active.clock.now();
        let port = message.port();
        let mut writer = active.outbound[port].lock().unwrap_or_else(PoisonError::into_inner);
        if writer.write(port, time, message.bytes()) {
            log::trace!("[JACK] t={} {:?} queued", time, message);
            Ok(SendOutcome::Sent)
        } else {
            Ok(SendOutcome::Dropped)
        }
    }

    fn subscribe(&self, callback: ReceiveCallback) {
        self.observers.subscribe(callback);
    }

    fn unsubscribe_all(&self) {
        self.observers.clear();
    }

    fn set_device_lost_handler(&self, handler: DeviceLostCallback) {
        *self.lost.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_send_on_closed_transport() {
        let transport = RealtimeTransport::new();
        assert!(!transport.is_open());
        let msg = RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 0);
        assert!(matches!(
            transport.send_data(&msg),
            Err(Error::NotOpen(TransportKind::Realtime))
        ));
    }

    #[test]
    fn test_server_shutdown_stops_capture_and_reports_loss() {
        use crate::rt::ring::EventRing;

        let (_writer, reader) = EventRing::with_capacity(256);
        let clock = Arc::new(FrameClock::new(48_000));
        let waker = Arc::new(Waker::new());
        let closed = Arc::new(AtomicBool::new(false));
        let capture = Capture::new(
            reader,
            ReorderQueue::with_capacity(8, 64),
            clock.clone(),
            Arc::new(Observers::new()),
        );
        let mut worker = capture::spawn(capture, waker.clone(), closed.clone()).unwrap();

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let handler: DeviceLostCallback = Arc::new(move |kind: TransportKind| {
            sink.lock().unwrap().push(kind);
        });
        let lost: LostSlot = Arc::new(Mutex::new(Some(handler)));

        let server_gone = Arc::new(AtomicBool::new(false));
        let mut notifications = Notifications {
            closed: closed.clone(),
            server_gone: server_gone.clone(),
            lost,
            clock,
            waker,
        };
        jack::NotificationHandler::shutdown(&mut notifications, ClientStatus::empty(), "server stopped");

        assert_eq!(*reported.lock().unwrap(), vec![TransportKind::Realtime]);
        assert!(closed.load(Ordering::Acquire));
        assert!(server_gone.load(Ordering::Acquire));

        let deadline = Instant::now() + Duration::from_secs(1);
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(worker.is_finished());
        assert!(worker.stop(Duration::from_millis(100), &|| {}));
    }

    #[test]
    #[ignore = "needs a running JACK server"]
    fn test_open_close_reopen() {
        let transport = RealtimeTransport::new();
        for _ in 0..3 {
            transport.open_with("midibus-test", 2).unwrap();
            assert!(transport.is_open());
            transport.close();
            assert!(!transport.is_open());
        }
    }

    /// out_1 of one client wired to in_1 of another
    #[test]
    #[ignore = "needs a running JACK server"]
    fn test_out_port_reaches_peer_in_port() {
        let sender = RealtimeTransport::new();
        let receiver = RealtimeTransport::new();
        sender.open_with("midibus-tx", 1).unwrap();
        receiver.open_with("midibus-rx", 1).unwrap();

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        receiver.subscribe(Arc::new(move |msg: &RawMidiMessage| {
            sink.lock().unwrap().push(msg.clone());
        }));

        {
            let guard = sender.lock();
            let client = guard.as_ref().unwrap().client.as_client();
            client
                .connect_ports_by_name("midibus-tx:out_1", "midibus-rx:in_1")
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while got.lock().unwrap().is_empty() && Instant::now() < deadline {
            sender
                .send_data(&RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 0))
                .unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(got.lock().unwrap()[0].bytes(), &[0x90, 0x40, 0x7F]);
        assert_eq!(got.lock().unwrap()[0].port(), 0);
    }
}
