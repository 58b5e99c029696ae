//! In-memory transport for router and manager tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::message::{RawMidiMessage, MAX_MESSAGE_SIZE};
use crate::transport::{
    validate_outbound, DeviceLostCallback, Observers, ReceiveCallback, SendOutcome, Transport, TransportKind,
};

pub struct MockTransport {
    kind: TransportKind,
    observers: Observers,
    open: AtomicBool,
    num_ports: AtomicUsize,
    fail_open: AtomicBool,
    opens: AtomicUsize,
    sent: Mutex<Vec<RawMidiMessage>>,
    lost: Mutex<Option<DeviceLostCallback>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            observers: Observers::new(),
            open: AtomicBool::new(false),
            num_ports: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            lost: Mutex::new(None),
        })
    }

    /// Pretend the medium delivered `message`
    pub fn inject(&self, message: &RawMidiMessage) {
        self.observers.emit(message);
    }

    pub fn sent(&self) -> Vec<RawMidiMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    /// Simulate the medium dying underneath us
    pub fn lose(&self) {
        self.open.store(false, Ordering::SeqCst);
        let handler = self.lost.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(self.kind);
        }
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(&self, config: &BridgeConfig) -> Result<()> {
        self.close();
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "mock open failure",
            )));
        }
        self.num_ports.store(config.num_ports, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_data(&self, message: &RawMidiMessage) -> Result<SendOutcome> {
        if !self.is_open() {
            return Err(Error::NotOpen(self.kind));
        }
        validate_outbound(message, self.num_ports.load(Ordering::SeqCst), MAX_MESSAGE_SIZE)?;
        self.sent.lock().unwrap().push(message.clone());
        Ok(SendOutcome::Sent)
    }

    fn subscribe(&self, callback: ReceiveCallback) {
        self.observers.subscribe(callback);
    }

    fn unsubscribe_all(&self) {
        self.observers.clear();
    }

    fn set_device_lost_handler(&self, handler: DeviceLostCallback) {
        *self.lost.lock().unwrap() = Some(handler);
    }
}
