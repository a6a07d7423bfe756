//! sx-core: Core abstractions and configuration for shellmux
//!
//! This crate provides the error taxonomy, configuration structures and the
//! transport boundary traits shared by the server and its embedders.

pub mod config;
pub mod error;
pub mod traits;

pub use error::{ChannelError, ConfigError, ConnectionError, SessionError, SxError};
