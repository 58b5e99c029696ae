//! Full-mesh wiring between transports
//!
//! Every transport's received messages are delivered to every *other*
//! connected transport on the same port index. Wiring holds `Weak` references
//! so a subscription never keeps a transport alive.

use std::sync::{Arc, Weak};

use crate::message::RawMidiMessage;
use crate::transport::Transport;

/// Static fan-out between the transports of one setup
#[derive(Default)]
pub struct TransportRouter {
    connected: Vec<Arc<dyn Transport>>,
}

impl TransportRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire every transport to every other one, replacing any previous wiring
    pub fn connect(&mut self, transports: &[Arc<dyn Transport>]) {
        self.disconnect();

        for (i, source) in transports.iter().enumerate() {
            let targets: Vec<Weak<dyn Transport>> = transports
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, target)| Arc::downgrade(target))
                .collect();

            if targets.is_empty() {
                continue;
            }

            log::debug!(
                "[BRIDGE] {} -> {}",
                source.kind(),
                transports
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, t)| t.kind().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            source.subscribe(Arc::new(move |message: &RawMidiMessage| {
                for target in &targets {
                    if let Some(target) = target.upgrade() {
                        target.receive(message);
                    }
                }
            }));
        }

        self.connected = transports.to_vec();
    }

    /// Remove all wiring installed by `connect`
    pub fn disconnect(&mut self) {
        for transport in self.connected.drain(..) {
            transport.unsubscribe_all();
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.connected.is_empty()
    }

    /// Connected transports, in wiring order
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.connected
    }
}
