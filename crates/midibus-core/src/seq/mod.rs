//! ALSA sequencer transport
//!
//! One sequencer client with `num_ports` duplex ports named `port {i}`, open
//! for both direct and subscribed traffic. Each output port has its own
//! encoder; the listener thread owns decoding through one shared decoder.
//!
//! The client handle sits in an `Arc<Mutex<Option<..>>>` shared with the
//! listener. `close` takes it out after the listener has stopped, so a
//! detached listener finds `None` and exits instead of touching a dead client.

pub mod codec;

use std::ffi::CString;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alsa::seq::{Event, MidiEvent, PortCap, PortType, Seq};
use alsa::{Direction, PollDescriptors};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::message::{RawMidiMessage, MAX_MESSAGE_SIZE};
use crate::transport::{validate_outbound, Observers, ReceiveCallback, SendOutcome, Transport, TransportKind};
use crate::worker::{WorkerThread, DEFAULT_JOIN_TIMEOUT};

/// Poll timeout between run-flag checks (milliseconds)
const POLL_TIMEOUT_MS: i32 = 1000;

/// Client, ports and coders of an open sequencer transport
struct SeqHandle {
    seq: Seq,
    ports: Vec<i32>,
    encoders: Vec<MidiEvent>,
    decoder: MidiEvent,
}

// SAFETY: the ALSA handles are only ever used by one thread at a time, under
// the transport's mutex. They hold no thread-local state.
unsafe impl Send for SeqHandle {}

type SharedHandle = Arc<Mutex<Option<SeqHandle>>>;

fn lock(handle: &Mutex<Option<SeqHandle>>) -> MutexGuard<'_, Option<SeqHandle>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SeqHandle {
    fn open(client_name: &str, num_ports: usize) -> Result<Self> {
        let seq = Seq::open(None, None, true)?;
        let name = CString::new(client_name)
            .map_err(|_| Error::InvalidConfig(format!("invalid client name {:?}", client_name)))?;
        seq.set_client_name(&name)?;

        let caps = PortCap::READ | PortCap::WRITE | PortCap::SUBS_READ | PortCap::SUBS_WRITE | PortCap::DUPLEX;
        let kind = PortType::MIDI_GENERIC | PortType::APPLICATION;

        let mut ports = Vec::with_capacity(num_ports);
        let mut encoders = Vec::with_capacity(num_ports);
        for i in 0..num_ports {
            let port_name = CString::new(format!("port {}", i))
                .map_err(|e| Error::Sequencer(e.to_string()))?;
            ports.push(seq.create_simple_port(&port_name, caps, kind)?);
            encoders.push(codec::new_coder()?);
        }
        let decoder = codec::new_coder()?;

        Ok(Self {
            seq,
            ports,
            encoders,
            decoder,
        })
    }

    fn send(&mut self, message: &RawMidiMessage) -> Result<()> {
        let Self { seq, ports, encoders, .. } = self;
        let source = ports[message.port()];

        let output = |event: &mut Event| -> alsa::Result<()> {
            event.set_source(source);
            event.set_subs();
            event.set_direct();
            seq.event_output(event).map(|_| ())
        };

        if message.is_sysex() {
            let mut event = codec::sysex_event(message.bytes());
            output(&mut event)?;
        } else {
            codec::encode_bytes(&mut encoders[message.port()], message.bytes(), output)?;
        }
        seq.drain_output()?;
        Ok(())
    }

    /// Pull every pending inbound event and decode it
    fn drain(&mut self, buf: &mut [u8]) -> Vec<RawMidiMessage> {
        let Self { seq, ports, decoder, .. } = self;
        let mut messages = Vec::new();
        let mut input = seq.input();

        loop {
            match input.event_input_pending(true) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("[SEQ] event_input_pending: {}", e);
                    break;
                }
            }
            let mut event = match input.event_input() {
                Ok(event) => event,
                Err(e) => {
                    log::debug!("[SEQ] event_input: {}", e);
                    break;
                }
            };

            let dest = event.get_dest().port;
            let Some(port) = ports.iter().position(|&p| p == dest) else {
                continue;
            };
            if let Some(bytes) = codec::decode_event(decoder, &mut event, buf) {
                messages.push(RawMidiMessage::new(bytes, port));
            }
        }
        messages
    }
}

impl Drop for SeqHandle {
    fn drop(&mut self) {
        for &port in &self.ports {
            if let Err(e) = self.seq.delete_port(port) {
                log::debug!("[SEQ] delete_port {}: {}", port, e);
            }
        }
    }
}

/// ALSA sequencer transport
pub struct SequencerTransport {
    handle: SharedHandle,
    listener: Mutex<Option<WorkerThread>>,
    observers: Arc<Observers>,
}

impl Default for SequencerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencerTransport {
    pub fn new() -> Self {
        Self {
            handle: Arc::new(Mutex::new(None)),
            listener: Mutex::new(None),
            observers: Arc::new(Observers::new()),
        }
    }

    /// Register the client and its ports, then start the listener
    pub fn open_with(&self, client_name: &str, num_ports: usize) -> Result<()> {
        self.close();

        if num_ports == 0 {
            return Err(Error::InvalidConfig("num_ports must be at least 1".into()));
        }

        let handle = SeqHandle::open(client_name, num_ports)?;
        let fds = (&handle.seq, Some(Direction::Capture)).get()?;
        *lock(&self.handle) = Some(handle);

        let shared = self.handle.clone();
        let observers = self.observers.clone();
        let spawned = WorkerThread::spawn("midibus-seq", move |running| {
            listen(fds, &shared, &running, &observers);
            log::debug!("[SEQ] Listener exited");
        });

        match spawned {
            Ok(worker) => {
                *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
                log::info!("[SEQ] Open: client {:?} with {} port(s)", client_name, num_ports);
                Ok(())
            }
            Err(e) => {
                lock(&self.handle).take();
                Err(e)
            }
        }
    }
}

fn listen(
    mut fds: Vec<alsa::poll::pollfd>,
    handle: &Mutex<Option<SeqHandle>>,
    running: &std::sync::atomic::AtomicBool,
    observers: &Observers,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    while running.load(Ordering::Acquire) {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        match alsa::poll::poll(&mut fds, POLL_TIMEOUT_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                log::error!("[SEQ] poll failed: {}", e);
                break;
            }
        }

        let messages = {
            let mut guard = lock(handle);
            match guard.as_mut() {
                Some(handle) => handle.drain(&mut buf),
                None => break,
            }
        };

        for message in &messages {
            log::trace!("[SEQ] {:?}", message);
            observers.emit(message);
        }
    }
}

impl Transport for SequencerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sequencer
    }

    fn open(&self, config: &BridgeConfig) -> Result<()> {
        self.open_with(&config.client_name, config.num_ports)
    }

    fn close(&self) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut listener) = listener {
            listener.stop(DEFAULT_JOIN_TIMEOUT, &|| {});
        }
        if lock(&self.handle).take().is_some() {
            log::info!("[SEQ] Closed");
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.handle).is_some()
    }

    fn send_data(&self, message: &RawMidiMessage) -> Result<SendOutcome> {
        let mut guard = lock(&self.handle);
        let handle = guard.as_mut().ok_or(Error::NotOpen(TransportKind::Sequencer))?;
        validate_outbound(message, handle.ports.len(), MAX_MESSAGE_SIZE)?;
        handle.send(message)?;
        log::trace!("[SEQ] {:?} sent", message);
        Ok(SendOutcome::Sent)
    }

    fn subscribe(&self, callback: ReceiveCallback) {
        self.observers.subscribe(callback);
    }

    fn unsubscribe_all(&self) {
        self.observers.clear();
    }
}

impl Drop for SequencerTransport {
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
        let transport = SequencerTransport::new();
        assert!(!transport.is_open());
        let msg = RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 0);
        assert!(matches!(
            transport.send_data(&msg),
            Err(Error::NotOpen(TransportKind::Sequencer))
        ));
        transport.close();
    }

    #[test]
    #[ignore = "needs /dev/snd/seq"]
    fn test_open_close_reopen() {
        let transport = SequencerTransport::new();
        for _ in 0..3 {
            transport.open_with("midibus-test", 2).unwrap();
            assert!(transport.is_open());
            transport.close();
            assert!(!transport.is_open());
        }
    }

    #[test]
    #[ignore = "needs /dev/snd/seq"]
    fn test_bad_port_rejected() {
        let transport = SequencerTransport::new();
        transport.open_with("midibus-test", 1).unwrap();
        let msg = RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 1);
        assert!(matches!(
            transport.send_data(&msg),
            Err(Error::InvalidPort { port: 1, num_ports: 1 })
        ));
    }

    /// Two clients wired port-to-port; SysEx must cross unchanged
    #[test]
    #[ignore = "needs /dev/snd/seq"]
    fn test_sysex_between_clients() {
        let sender = SequencerTransport::new();
        let receiver = SequencerTransport::new();
        sender.open_with("midibus-tx", 1).unwrap();
        receiver.open_with("midibus-rx", 1).unwrap();

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        receiver.subscribe(Arc::new(move |msg: &RawMidiMessage| {
            sink.lock().unwrap().push(msg.clone());
        }));

        let (tx_client, tx_port, rx_client, rx_port) = {
            let tx = lock(&sender.handle);
            let rx = lock(&receiver.handle);
            let tx = tx.as_ref().unwrap();
            let rx = rx.as_ref().unwrap();
            (tx.seq.client_id().unwrap(), tx.ports[0], rx.seq.client_id().unwrap(), rx.ports[0])
        };
        let subs = alsa::seq::PortSubscribe::empty().unwrap();
        subs.set_sender(alsa::seq::Addr { client: tx_client, port: tx_port });
        subs.set_dest(alsa::seq::Addr { client: rx_client, port: rx_port });
        lock(&sender.handle).as_ref().unwrap().seq.subscribe_port(&subs).unwrap();

        let sysex = vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0x00, 0x11, 0xF7];
        sender.send_data(&RawMidiMessage::new(sysex.clone(), 0)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while got.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got.lock().unwrap()[0].bytes(), sysex.as_slice());
    }
}
