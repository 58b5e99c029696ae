//! UDP multicast transport
//!
//! Logical port `i` maps to UDP port `base_port + i` on one multicast group.
//! Each port has an input socket (bound to the group port, member of the
//! group) and an output socket (ephemeral port, multicast loopback off so a
//! host never hears its own output). One datagram carries exactly one MIDI
//! message with no framing.

mod iface;
mod listener;

pub use iface::{interface_index, interface_ipv4};
pub use listener::POLL_TIMEOUT_MS;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::message::{RawMidiMessage, MAX_MESSAGE_SIZE};
use crate::transport::{validate_outbound, Observers, ReceiveCallback, SendOutcome, Transport, TransportKind};
use crate::worker::{WorkerThread, DEFAULT_JOIN_TIMEOUT};

/// Interface selection resolved from the configured name
#[derive(Debug, Clone, Copy)]
enum Interface {
    Any,
    V4(Ipv4Addr),
    V6(u32),
}

impl Interface {
    fn resolve(name: Option<&str>, group: IpAddr) -> Result<Self> {
        let Some(name) = name else {
            return Ok(Interface::Any);
        };
        match group {
            IpAddr::V4(_) => Ok(Interface::V4(iface::interface_ipv4(name)?)),
            IpAddr::V6(_) => Ok(Interface::V6(iface::interface_index(name)?)),
        }
    }
}

/// Send side of an open transport
struct Outputs {
    sockets: Vec<UdpSocket>,
    destinations: Vec<SocketAddr>,
}

struct Link {
    outputs: Arc<Outputs>,
    listener: WorkerThread,
}

/// UDP multicast transport
pub struct NetworkTransport {
    link: Mutex<Option<Link>>,
    observers: Arc<Observers>,
}

impl Default for NetworkTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkTransport {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            observers: Arc::new(Observers::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open `num_ports` socket pairs on `group`, optionally restricted to `interface`
    ///
    /// Any failure releases whatever was already created.
    pub fn open_with(
        &self,
        interface: Option<&str>,
        group: IpAddr,
        base_port: u16,
        num_ports: usize,
    ) -> Result<()> {
        self.close();

        if !group.is_multicast() {
            return Err(Error::InvalidAddress(group.to_string()));
        }
        if num_ports == 0 {
            return Err(Error::InvalidConfig("num_ports must be at least 1".into()));
        }

        let iface = Interface::resolve(interface, group)?;

        let mut inputs = Vec::with_capacity(num_ports);
        let mut outputs = Vec::with_capacity(num_ports);
        let mut destinations = Vec::with_capacity(num_ports);

        for i in 0..num_ports {
            let port = port_for(base_port, i)?;
            inputs.push(bind_input(group, port, iface)?);
            outputs.push(bind_output(group, iface)?);
            destinations.push(SocketAddr::new(group, port));
        }

        let listener = listener::spawn(inputs, self.observers.clone())?;

        log::info!(
            "[NET] Open: {} port(s) on {}:{}{}",
            num_ports,
            group,
            base_port,
            interface.map(|name| format!(" via {}", name)).unwrap_or_default()
        );

        *self.lock() = Some(Link {
            outputs: Arc::new(Outputs {
                sockets: outputs,
                destinations,
            }),
            listener,
        });
        Ok(())
    }

    fn outputs(&self) -> Option<Arc<Outputs>> {
        self.lock().as_ref().map(|link| link.outputs.clone())
    }
}

fn port_for(base_port: u16, index: usize) -> Result<u16> {
    u16::try_from(index)
        .ok()
        .and_then(|offset| base_port.checked_add(offset))
        .ok_or_else(|| {
            Error::InvalidConfig(format!("udp port {} + {} out of range", base_port, index))
        })
}

fn bind_input(group: IpAddr, port: u16, iface: Interface) -> Result<UdpSocket> {
    match group {
        IpAddr::V4(group) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
            let local = match iface {
                Interface::V4(addr) => addr,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group, &local)?;
            Ok(socket)
        }
        IpAddr::V6(group) => {
            let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port))?;
            let index = match iface {
                Interface::V6(index) => index,
                _ => 0,
            };
            socket.join_multicast_v6(&group, index)?;
            Ok(socket)
        }
    }
}

fn bind_output(group: IpAddr, iface: Interface) -> Result<UdpSocket> {
    match group {
        IpAddr::V4(_) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            socket.set_multicast_loop_v4(false)?;
            if let Interface::V4(addr) = iface {
                iface::set_multicast_if_v4(&socket, addr)?;
            }
            Ok(socket)
        }
        IpAddr::V6(_) => {
            let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?;
            socket.set_multicast_loop_v6(false)?;
            if let Interface::V6(index) = iface {
                iface::set_multicast_if_v6(&socket, index)?;
            }
            Ok(socket)
        }
    }
}

impl Transport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn open(&self, config: &BridgeConfig) -> Result<()> {
        self.open_with(
            config.network.interface(),
            config.network.multicast_address,
            config.network.udp_port,
            config.num_ports,
        )
    }

    fn close(&self) {
        let Some(mut link) = self.lock().take() else {
            return;
        };
        // Listener owns the input sockets; they close when it exits
        link.listener.stop(DEFAULT_JOIN_TIMEOUT, &|| {});
        drop(link);
        log::info!("[NET] Closed");
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn send_data(&self, message: &RawMidiMessage) -> Result<SendOutcome> {
        let outputs = self.outputs().ok_or(Error::NotOpen(TransportKind::Network))?;
        validate_outbound(message, outputs.sockets.len(), MAX_MESSAGE_SIZE)?;

        let port = message.port();
        outputs.sockets[port].send_to(message.bytes(), outputs.destinations[port])?;
        log::trace!("[NET] {:?} -> {}", message, outputs.destinations[port]);
        Ok(SendOutcome::Sent)
    }

    fn subscribe(&self, callback: ReceiveCallback) {
        self.observers.subscribe(callback);
    }

    fn unsubscribe_all(&self) {
        self.observers.clear();
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const GROUP: IpAddr = IpAddr::V4(Ipv4Addr::new(239, 255, 77, 37));

    #[test]
    fn test_send_on_closed_transport() {
        let transport = NetworkTransport::new();
        let msg = RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 0);
        assert!(matches!(
            transport.send_data(&msg),
            Err(Error::NotOpen(TransportKind::Network))
        ));
    }

    #[test]
    fn test_unicast_group_rejected() {
        let transport = NetworkTransport::new();
        let err = transport
            .open_with(None, "10.0.0.1".parse().unwrap(), 21928, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_unknown_interface_leaves_closed() {
        let transport = NetworkTransport::new();
        let err = transport
            .open_with(Some("nosuchif0"), GROUP, 0, 1)
            .unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_port_overflow() {
        assert_eq!(port_for(21928, 3).unwrap(), 21931);
        assert!(port_for(65535, 1).is_err());
    }

    #[test]
    #[ignore = "joins a multicast group; needs a multicast-capable route"]
    fn test_open_close_reopen_and_bad_port() {
        // Fixed ports: each reopen only succeeds if close released them
        let base_port = 41930;
        let transport = NetworkTransport::new();
        for _ in 0..3 {
            transport.open_with(None, GROUP, base_port, 2).unwrap();
            assert!(transport.is_open());

            let msg = RawMidiMessage::new(vec![0x90, 0x40, 0x7F], 2);
            assert!(matches!(
                transport.send_data(&msg),
                Err(Error::InvalidPort { port: 2, num_ports: 2 })
            ));

            transport.close();
            assert!(!transport.is_open());
            transport.close();

            // Nothing else holds the input ports any more
            for port in base_port..base_port + 2 {
                drop(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap());
            }
        }
    }

    #[test]
    #[ignore = "joins a multicast group; needs a multicast-capable route"]
    fn test_peer_note_on_received_on_port_zero() {
        let base_port = 31928;
        let transport = NetworkTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        let got = Arc::new(Mutex::new(None));
        {
            let count = count.clone();
            let got = got.clone();
            transport.subscribe(Arc::new(move |msg: &RawMidiMessage| {
                *got.lock().unwrap() = Some(msg.clone());
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        transport.open_with(None, GROUP, base_port, 1).unwrap();

        // A peer on the same group; loopback must be on for it to reach us locally
        let peer = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        peer.set_multicast_loop_v4(true).unwrap();
        peer.send_to(&[0x90, 0x40, 0x7F], (GROUP, base_port)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let msg = got.lock().unwrap().clone().unwrap();
        assert_eq!(msg.bytes(), &[0x90, 0x40, 0x7F]);
        assert_eq!(msg.port(), 0);

        // Our own output must not come back
        let before = count.load(Ordering::SeqCst);
        transport
            .send_data(&RawMidiMessage::new(vec![0x80, 0x40, 0x00], 0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), before);

        transport.close();
    }
}
