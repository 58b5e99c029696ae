//! Bridge error types

use thiserror::Error;

use crate::transport::TransportKind;

/// Errors that can occur while opening or driving a transport
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or thread level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message addressed to a port outside `0..num_ports`
    #[error("Invalid port {port} (transport has {num_ports} ports)")]
    InvalidPort { port: usize, num_ports: usize },

    /// Zero-length message
    #[error("Empty MIDI message")]
    EmptyMessage,

    /// Message larger than the transport can carry
    #[error("MIDI message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    /// Operation on a closed transport
    #[error("{0} transport is not open")]
    NotOpen(TransportKind),

    /// Named network interface missing, down, or without a usable address
    #[error("Network interface error: {0}")]
    Interface(String),

    /// Address is not a multicast group
    #[error("Invalid multicast address: {0}")]
    InvalidAddress(String),

    /// ALSA sequencer failure
    #[error("ALSA sequencer error: {0}")]
    Sequencer(String),

    /// JACK client failure
    #[error("JACK error: {0}")]
    Jack(String),

    /// Configuration rejected by validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

#[cfg(all(target_os = "linux", feature = "alsa-seq"))]
impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Self {
        Error::Sequencer(e.to_string())
    }
}

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
impl From<jack::Error> for Error {
    fn from(e: jack::Error) -> Self {
        Error::Jack(e.to_string())
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;
