//! Core error types for shellmux

use std::path::PathBuf;

use sx_protocol::ProtocolError;
use thiserror::Error;

/// Top-level error type for the shellmux ecosystem
#[derive(Error, Debug)]
pub enum SxError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-level (transport) errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// SSH handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Too many concurrent connections
    #[error("Connection limit of {limit} reached")]
    LimitExceeded { limit: u32 },

    /// Transport failure after the handshake
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Channel-level errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Channel type other than `session`
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    /// Too many channels on one connection
    #[error("Channel limit of {limit} reached")]
    LimitExceeded { limit: u32 },

    /// Transport could not open the channel
    #[error("Could not accept channel: {0}")]
    Accept(String),

    /// Peer sent a request that could not be decoded
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Session I/O errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session was disconnected or its channel closed
    #[error("Session closed")]
    Closed,

    /// Stream read/write failure
    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
