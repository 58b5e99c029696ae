//! Command line options
//!
//! Anything given here overrides the config file.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use midibus_core::BridgeConfig;

#[derive(Parser, Debug, Default, Clone, PartialEq)]
#[command(author, version, about = "MIDI network gateway", long_about = None)]
pub struct Args {
    /// Read configuration from this file (default: ~/.config/midibus/config.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use this number of ports (default: 1)
    #[arg(short, long)]
    pub num_ports: Option<usize>,

    /// Use a specific network interface; empty selects all (default: all)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Use a specific multicast group address (default: 225.0.0.37)
    #[arg(short = 'a', long)]
    pub udp_addr: Option<IpAddr>,

    /// Use a specific base UDP port (default: 21928)
    #[arg(short = 'p', long, visible_alias = "port")]
    pub udp_port: Option<u16>,

    /// Disable the UDP multicast transport
    #[arg(long)]
    pub no_network: bool,

    /// Disable the ALSA MIDI transport
    #[arg(long)]
    pub no_alsa: bool,

    /// Disable the JACK MIDI transport
    #[arg(long)]
    pub no_jack: bool,
}

impl Args {
    /// Apply the overrides on top of a loaded configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(num_ports) = self.num_ports {
            config.num_ports = num_ports;
        }
        if let Some(interface) = &self.interface {
            config.network.interface = Some(interface.clone());
        }
        if let Some(addr) = self.udp_addr {
            config.network.multicast_address = addr;
        }
        if let Some(port) = self.udp_port {
            config.network.udp_port = port;
        }
        if self.no_network {
            config.network_enabled = false;
        }
        if self.no_alsa {
            config.alsa_midi = false;
        }
        if self.no_jack {
            config.jack_midi = false;
        }
    }
}
