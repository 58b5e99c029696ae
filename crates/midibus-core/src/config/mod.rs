//! Bridge configuration
//!
//! The configuration record consumed by [`DeviceManager::setup`](crate::DeviceManager::setup):
//! port count, network parameters and per-transport enable flags. It is
//! immutable for the lifetime of one setup; change it with
//! [`DeviceManager::set_config`](crate::DeviceManager::set_config) and reset.
//!
//! # Usage
//!
//! ```ignore
//! use midibus_core::config::{default_config_path, load_config, BridgeConfig};
//!
//! let config: BridgeConfig = load_config(&default_config_path());
//! config.validate()?;
//! ```

mod io;
mod paths;

pub use io::{load_config, load_config_strict};
pub use paths::{default_config_path, CONFIG_FILENAME};

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// Default multicast group shared by every bridge on the LAN
pub const DEFAULT_MULTICAST_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(225, 0, 0, 37));

/// Default base UDP port (port `i` uses `DEFAULT_UDP_PORT + i`)
pub const DEFAULT_UDP_PORT: u16 = 21928;

/// Default client name registered with ALSA and JACK
pub const DEFAULT_CLIENT_NAME: &str = "midibus";

/// Upper bound on logical ports
pub const MAX_PORTS: usize = 64;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Number of logical ports, identical on every transport
    pub num_ports: usize,
    /// Client name used for the sequencer and JACK clients
    pub client_name: String,
    /// UDP multicast settings
    pub network: NetworkConfig,
    /// Enable the UDP multicast transport
    pub network_enabled: bool,
    /// Enable the ALSA sequencer transport
    pub alsa_midi: bool,
    /// Enable the JACK MIDI transport
    pub jack_midi: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            num_ports: 1,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            network: NetworkConfig::default(),
            network_enabled: true,
            alsa_midi: true,
            jack_midi: true,
        }
    }
}

/// Network section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind multicast traffic to; empty or absent means all
    pub interface: Option<String>,
    /// Multicast group (IPv4 or IPv6)
    pub multicast_address: IpAddr,
    /// Base UDP port
    pub udp_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            multicast_address: DEFAULT_MULTICAST_ADDRESS,
            udp_port: DEFAULT_UDP_PORT,
        }
    }
}

impl NetworkConfig {
    /// Interface name, with the empty string folded into `None`
    pub fn interface(&self) -> Option<&str> {
        self.interface
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

impl BridgeConfig {
    /// Whether the given transport should be opened and wired
    pub fn is_enabled(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Network => self.network_enabled,
            TransportKind::Sequencer => self.alsa_midi,
            TransportKind::Realtime => self.jack_midi,
        }
    }

    /// Check the record before any transport sees it
    pub fn validate(&self) -> Result<()> {
        if self.num_ports == 0 {
            return Err(Error::InvalidConfig("num_ports must be at least 1".into()));
        }
        if self.num_ports > MAX_PORTS {
            return Err(Error::InvalidConfig(format!(
                "num_ports must be at most {} (got {})",
                MAX_PORTS, self.num_ports
            )));
        }
        if self.client_name.trim().is_empty() {
            return Err(Error::InvalidConfig("client_name must not be empty".into()));
        }
        if !self.network.multicast_address.is_multicast() {
            return Err(Error::InvalidAddress(
                self.network.multicast_address.to_string(),
            ));
        }
        let last_port = self.network.udp_port as usize + self.num_ports - 1;
        if last_port > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "udp_port {} + {} ports exceeds 65535",
                self.network.udp_port, self.num_ports
            )));
        }
        Ok(())
    }
}
