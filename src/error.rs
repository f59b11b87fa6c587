use thiserror::Error;

use crate::address::{Address, AddressError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address in configuration: {0}")]
    Address(#[from] AddressError),

    #[error("Transport initialization failed: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Failures of the request/ACK byte transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {address} failed: {source}")]
    Connect {
        address: Address,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out talking to {0}")]
    Timeout(Address),

    #[error("Unexpected reply from {address}: {reply:?}")]
    BadAck { address: Address, reply: Vec<u8> },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("No route to {0}")]
    Unreachable(Address),

    #[error("Inbox closed, dropping frame")]
    InboxClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
