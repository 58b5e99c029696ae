//! Device manager: atomic setup of the enabled transports
//!
//! `setup` closes everything, then opens the enabled transports in the fixed
//! order Network, Sequencer, Realtime. If any of them fails, the ones already
//! opened are closed again, the failure is reported once through the message
//! handler, and the error is returned. On success the router wires the opened
//! transports into a full mesh.
//!
//! `reset` is `setup` plus a retry timer: on failure it schedules another
//! attempt after [`RETRY_INTERVAL`] until one succeeds or the manager closes.
//!
//! # Usage
//!
//! ```ignore
//! let manager = DeviceManager::new(config, Arc::new(|title, body| log::error!("{}: {}", title, body)));
//! manager.reset()?;
//! for event in manager.events() {
//!     if let ManagerEvent::DeviceLost(_) = event {
//!         let _ = manager.reset();
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::router::TransportRouter;
use crate::transport::{Transport, TransportKind};

/// Delay between automatic setup retries
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Title prefix for user-facing error messages
const APP_TITLE: &str = "midibus";

/// User-facing error sink: `(title, body)`
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Asynchronous notifications from the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A transport died on its own (e.g. the JACK server shut down)
    DeviceLost(TransportKind),
    /// A scheduled retry brought the bridge back up
    Recovered,
}

/// Title and body reported when `kind` fails to open
fn failure_message(kind: TransportKind) -> (String, String) {
    let body = match kind {
        TransportKind::Network => {
            "The network interface could not be established.\n\n\
             Please, make sure you have an on-line network connection and try again."
        }
        TransportKind::Sequencer => {
            "The ALSA MIDI interface could not be established.\n\n\
             Please, make sure you have a ALSA MIDI sub-system working correctly and try again."
        }
        TransportKind::Realtime => {
            "The JACK MIDI interface could not be established.\n\n\
             Please, make sure you have a JACK MIDI sub-system working correctly and try again."
        }
    };
    (format!("{} Interface Error - {}", kind, APP_TITLE), body.to_string())
}

/// Transports compiled into this build, in open order
pub fn default_transports() -> Vec<Arc<dyn Transport>> {
    #[allow(unused_mut)]
    let mut transports: Vec<Arc<dyn Transport>> = vec![Arc::new(crate::net::NetworkTransport::new())];

    #[cfg(all(target_os = "linux", feature = "alsa-seq"))]
    transports.push(Arc::new(crate::seq::SequencerTransport::new()));

    #[cfg(all(target_os = "linux", feature = "jack-backend"))]
    transports.push(Arc::new(crate::rt::RealtimeTransport::new()));

    transports
}

/// Pending retry; dropping it cancels the timer thread
struct RetryTimer {
    _cancel: Sender<()>,
}

impl RetryTimer {
    fn spawn(inner: Weak<Inner>, interval: Duration) -> Result<Self> {
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(1);
        thread::Builder::new()
            .name("midibus-retry".into())
            .spawn(move || match cancel_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.retry();
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            })?;
        Ok(Self { _cancel: cancel_tx })
    }
}

struct Inner {
    config: Mutex<BridgeConfig>,
    transports: Vec<Arc<dyn Transport>>,
    router: Mutex<TransportRouter>,
    /// Serializes setup and close
    setup_lock: Mutex<()>,
    message_handler: MessageHandler,
    events_tx: Sender<ManagerEvent>,
    events_rx: Receiver<ManagerEvent>,
    retry: Mutex<Option<RetryTimer>>,
    retry_interval: Mutex<Duration>,
    /// Cleared by `close`; a timer that fires afterwards does nothing
    active: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn teardown(&self) {
        lock(&self.router).disconnect();
        for transport in self.transports.iter().rev() {
            transport.close();
        }
    }

    /// Open the enabled transports; on failure returns which one failed
    fn setup_locked(&self, config: &BridgeConfig) -> std::result::Result<(), (Option<TransportKind>, Error)> {
        self.teardown();
        config.validate().map_err(|e| (None, e))?;

        for kind in TransportKind::ALL {
            if config.is_enabled(kind) && !self.transports.iter().any(|t| t.kind() == kind) {
                log::warn!("[BRIDGE] {} is enabled but not built in, skipping", kind);
            }
        }

        let mut opened: Vec<Arc<dyn Transport>> = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            let kind = transport.kind();
            if !config.is_enabled(kind) {
                log::debug!("[BRIDGE] {} disabled", kind);
                continue;
            }
            if let Err(e) = transport.open(config) {
                log::error!("[BRIDGE] {} failed to open: {}", kind, e);
                for done in opened.iter().rev() {
                    done.close();
                }
                return Err((Some(kind), e));
            }
            opened.push(transport.clone());
        }

        lock(&self.router).connect(&opened);
        log::info!(
            "[BRIDGE] Up: {} transport(s), {} port(s)",
            opened.len(),
            config.num_ports
        );
        Ok(())
    }

    fn setup(&self) -> Result<()> {
        self.run_setup(false).unwrap_or(Ok(()))
    }

    /// Setup under `setup_lock`; `None` when a retry finds the manager closed
    fn run_setup(&self, from_retry: bool) -> Option<Result<()>> {
        let config = lock(&self.config).clone();
        let result = {
            let _guard = lock(&self.setup_lock);
            if from_retry && !self.active.load(Ordering::Acquire) {
                return None;
            }
            self.setup_locked(&config)
        };

        Some(match result {
            Ok(()) => {
                self.cancel_retry();
                Ok(())
            }
            Err((kind, e)) => {
                let (title, body) = match kind {
                    Some(kind) => failure_message(kind),
                    None => (format!("Configuration Error - {}", APP_TITLE), e.to_string()),
                };
                (self.message_handler)(&title, &body);
                Err(e)
            }
        })
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.cancel_retry();
        let _guard = lock(&self.setup_lock);
        self.teardown();
    }

    fn cancel_retry(&self) {
        lock(&self.retry).take();
    }

    fn schedule_retry(self: &Arc<Self>) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let interval = *lock(&self.retry_interval);
        match RetryTimer::spawn(Arc::downgrade(self), interval) {
            Ok(timer) => {
                log::info!("[BRIDGE] Retrying in {:?}", interval);
                *lock(&self.retry) = Some(timer);
            }
            Err(e) => log::error!("[BRIDGE] Could not schedule retry: {}", e),
        }
    }

    fn reset(self: &Arc<Self>) -> Result<()> {
        self.active.store(true, Ordering::Release);
        let result = self.setup();
        if result.is_err() {
            self.schedule_retry();
        }
        result
    }

    /// Body of a fired retry timer
    fn retry(self: &Arc<Self>) {
        // This timer has fired; drop its slot so a new one can take its place
        lock(&self.retry).take();
        match self.run_setup(true) {
            None => log::debug!("[BRIDGE] Closed, retry skipped"),
            Some(Ok(())) => {
                let _ = self.events_tx.send(ManagerEvent::Recovered);
            }
            Some(Err(_)) => self.schedule_retry(),
        }
    }
}

/// Owns the transports and sequences their setup
pub struct DeviceManager {
    inner: Arc<Inner>,
}

impl DeviceManager {
    /// Manager over every transport compiled into this build
    pub fn new(config: BridgeConfig, message_handler: MessageHandler) -> Self {
        Self::with_transports(config, message_handler, default_transports())
    }

    /// Manager over an explicit transport set; open order is always
    /// Network, Sequencer, Realtime regardless of the order given
    pub fn with_transports(
        config: BridgeConfig,
        message_handler: MessageHandler,
        mut transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        transports.sort_by_key(|t| TransportKind::ALL.iter().position(|&k| k == t.kind()));

        let (events_tx, events_rx) = channel::unbounded();
        for transport in &transports {
            let tx = events_tx.clone();
            transport.set_device_lost_handler(Arc::new(move |kind| {
                log::warn!("[BRIDGE] {} lost", kind);
                let _ = tx.send(ManagerEvent::DeviceLost(kind));
            }));
        }

        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                transports,
                router: Mutex::new(TransportRouter::new()),
                setup_lock: Mutex::new(()),
                message_handler,
                events_tx,
                events_rx,
                retry: Mutex::new(None),
                retry_interval: Mutex::new(RETRY_INTERVAL),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Close all transports and open the enabled ones
    pub fn setup(&self) -> Result<()> {
        self.inner.setup()
    }

    /// `setup`, scheduling a retry on failure
    pub fn reset(&self) -> Result<()> {
        self.inner.reset()
    }

    /// Unwire and close every transport, cancelling any pending retry
    pub fn close(&self) {
        self.inner.close();
    }

    /// Receiver for asynchronous notifications
    pub fn events(&self) -> Receiver<ManagerEvent> {
        self.inner.events_rx.clone()
    }

    /// Replace the configuration used by the next setup
    pub fn set_config(&self, config: BridgeConfig) {
        *lock(&self.inner.config) = config;
    }

    pub fn config(&self) -> BridgeConfig {
        lock(&self.inner.config).clone()
    }

    pub fn set_retry_interval(&self, interval: Duration) {
        *lock(&self.inner.retry_interval) = interval;
    }

    pub fn is_retry_pending(&self) -> bool {
        lock(&self.inner.retry).is_some()
    }

    /// Kinds of the transports currently open
    pub fn open_transports(&self) -> Vec<TransportKind> {
        self.inner
            .transports
            .iter()
            .filter(|t| t.is_open())
            .map(|t| t.kind())
            .collect()
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RawMidiMessage;
    use crate::testing::MockTransport;
    use std::time::Instant;

    type Messages = Arc<Mutex<Vec<(String, String)>>>;

    fn handler() -> (MessageHandler, Messages) {
        let messages: Messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let handler: MessageHandler = Arc::new(move |title: &str, body: &str| {
            sink.lock().unwrap().push((title.to_string(), body.to_string()));
        });
        (handler, messages)
    }

    fn mocks() -> (Arc<MockTransport>, Arc<MockTransport>, Arc<MockTransport>) {
        (
            MockTransport::new(TransportKind::Network),
            MockTransport::new(TransportKind::Sequencer),
            MockTransport::new(TransportKind::Realtime),
        )
    }

    fn manager(config: BridgeConfig, net: &Arc<MockTransport>, seq: &Arc<MockTransport>, rt: &Arc<MockTransport>) -> (DeviceManager, Messages) {
        let (handler, messages) = handler();
        // Deliberately out of order; the manager sorts them
        let transports: Vec<Arc<dyn Transport>> = vec![rt.clone(), net.clone(), seq.clone()];
        (DeviceManager::with_transports(config, handler, transports), messages)
    }

    #[test]
    fn test_setup_opens_and_wires_all() {
        let (net, seq, rt) = mocks();
        let (manager, messages) = manager(BridgeConfig::default(), &net, &seq, &rt);

        manager.setup().unwrap();
        assert_eq!(
            manager.open_transports(),
            vec![TransportKind::Network, TransportKind::Sequencer, TransportKind::Realtime]
        );

        net.inject(&RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 0));
        assert_eq!(seq.sent().len(), 1);
        assert_eq!(rt.sent().len(), 1);
        assert!(net.sent().is_empty());
        assert!(messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_partial_failure_leaves_nothing_open() {
        let (net, seq, rt) = mocks();
        seq.set_fail_open(true);
        let (manager, messages) = manager(BridgeConfig::default(), &net, &seq, &rt);

        assert!(manager.setup().is_err());
        assert!(manager.open_transports().is_empty());
        assert_eq!(net.open_count(), 1);
        assert_eq!(rt.open_count(), 0);

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "ALSA MIDI Interface Error - midibus");
        assert!(messages[0].1.starts_with("The ALSA MIDI interface could not be established."));
    }

    #[test]
    fn test_disabled_transport_skipped() {
        let (net, seq, rt) = mocks();
        let config = BridgeConfig {
            jack_midi: false,
            ..Default::default()
        };
        let (manager, _messages) = manager(config, &net, &seq, &rt);

        manager.setup().unwrap();
        assert_eq!(rt.open_count(), 0);
        assert!(!rt.is_open());

        seq.inject(&RawMidiMessage::new(vec![0xB0, 0x07, 0x64], 0));
        assert_eq!(net.sent().len(), 1);
        assert!(rt.sent().is_empty());
    }

    #[test]
    fn test_invalid_config_reported() {
        let (net, seq, rt) = mocks();
        let config = BridgeConfig {
            num_ports: 0,
            ..Default::default()
        };
        let (manager, messages) = manager(config, &net, &seq, &rt);

        assert!(matches!(manager.setup(), Err(Error::InvalidConfig(_))));
        assert_eq!(net.open_count(), 0);
        assert!(messages.lock().unwrap()[0].0.starts_with("Configuration Error"));
    }

    #[test]
    fn test_repeated_setup_does_not_duplicate_wiring() {
        let (net, seq, rt) = mocks();
        let (manager, _messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        manager.setup().unwrap();
        manager.setup().unwrap();

        rt.inject(&RawMidiMessage::new(vec![0xFA], 0));
        assert_eq!(net.sent().len(), 1);
        assert_eq!(seq.sent().len(), 1);
    }

    #[test]
    fn test_close_unwires_and_closes() {
        let (net, seq, rt) = mocks();
        let (manager, _messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        manager.setup().unwrap();
        manager.close();

        assert!(manager.open_transports().is_empty());
        assert_eq!(net.subscriber_count(), 0);
        assert_eq!(seq.subscriber_count(), 0);
        assert_eq!(rt.subscriber_count(), 0);
    }

    #[test]
    fn test_device_lost_event() {
        let (net, seq, rt) = mocks();
        let (manager, _messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        let events = manager.events();
        manager.setup().unwrap();

        rt.lose();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ManagerEvent::DeviceLost(TransportKind::Realtime)
        );

        manager.reset().unwrap();
        assert!(rt.is_open());
    }

    #[test]
    fn test_reset_retries_until_success() {
        let (net, seq, rt) = mocks();
        rt.set_fail_open(true);
        let (manager, messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        manager.set_retry_interval(Duration::from_millis(20));
        let events = manager.events();

        assert!(manager.reset().is_err());
        assert!(manager.is_retry_pending());

        // Let at least one retry fail, then allow success
        let deadline = Instant::now() + Duration::from_secs(2);
        while rt.open_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(rt.open_count() >= 2);
        rt.set_fail_open(false);

        assert_eq!(
            events.recv_timeout(Duration::from_secs(2)).unwrap(),
            ManagerEvent::Recovered
        );
        assert!(!manager.is_retry_pending());
        assert_eq!(manager.open_transports().len(), 3);
        assert!(messages.lock().unwrap().len() >= 2);
    }

    #[test]
    fn test_close_cancels_retry() {
        let (net, seq, rt) = mocks();
        net.set_fail_open(true);
        let (manager, _messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        manager.set_retry_interval(Duration::from_millis(30));

        assert!(manager.reset().is_err());
        assert!(manager.is_retry_pending());
        manager.close();
        assert!(!manager.is_retry_pending());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(net.open_count(), 1);
    }

    #[test]
    fn test_set_config_applies_on_next_setup() {
        let (net, seq, rt) = mocks();
        let (manager, _messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        manager.setup().unwrap();

        manager.set_config(BridgeConfig {
            num_ports: 2,
            alsa_midi: false,
            ..Default::default()
        });
        assert_eq!(manager.config().num_ports, 2);
        manager.setup().unwrap();

        net.inject(&RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 1));
        assert_eq!(rt.sent()[0].port(), 1);
        assert!(!seq.is_open());
    }

    #[test]
    fn test_retry_firing_after_close_does_not_reopen() {
        let (net, seq, rt) = mocks();
        net.set_fail_open(true);
        let (manager, _messages) = manager(BridgeConfig::default(), &net, &seq, &rt);
        let events = manager.events();

        assert!(manager.reset().is_err());
        manager.close();
        net.set_fail_open(false);

        // A timer that already fired before close cancelled it
        manager.inner.retry();

        assert!(manager.open_transports().is_empty());
        assert_eq!(net.open_count(), 1);
        assert!(!manager.is_retry_pending());
        assert!(events.try_recv().is_err());
    }
}
