//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the session server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Path to the host private key (generated if missing)
    pub host_key_path: PathBuf,

    /// Inline host private key (OpenSSH or PEM text), preferred over the path
    pub host_key: Option<String>,

    /// Maximum number of concurrent connections
    pub max_connections: Option<u32>,

    /// Maximum number of open channels per connection
    pub max_channels_per_connection: Option<u32>,

    /// Delay before answering a rejected authentication attempt
    #[serde(with = "duration_secs")]
    pub auth_rejection_time: Duration,

    /// Per-session behavior
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2200".to_string(),
            host_key_path: PathBuf::from("id_rsa"),
            host_key: None,
            max_connections: None,
            max_channels_per_connection: None,
            auth_rejection_time: Duration::from_secs(1),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Replace the port of the bind address, keeping the host part
    pub fn set_port(&mut self, port: u16) {
        let host = match self.bind_address.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => self.bind_address.clone(),
        };
        self.bind_address = format!("{}:{}", host, port);
    }
}

/// Configuration applied to every accepted session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the resize event queue (at least 1)
    pub resize_buffer: usize,

    /// How long the dispatcher waits for queue room before dropping a resize
    /// event (milliseconds, 0 waits forever)
    #[serde(with = "duration_millis")]
    pub resize_timeout: Duration,

    /// Reply behavior for `window-change` requests
    pub window_change_reply: WindowChangeReply,

    /// Message written to the client on disconnect
    pub farewell: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resize_buffer: 8,
            resize_timeout: Duration::from_secs(5),
            window_change_reply: WindowChangeReply::Never,
            farewell: "bye\n\r".to_string(),
        }
    }
}

impl SessionConfig {
    /// Resize queue capacity, clamped to a usable value
    pub fn resize_capacity(&self) -> usize {
        self.resize_buffer.max(1)
    }

    /// Resize wait limit, `None` when the dispatcher should wait forever
    pub fn resize_wait(&self) -> Option<Duration> {
        (!self.resize_timeout.is_zero()).then_some(self.resize_timeout)
    }
}

/// Whether `window-change` requests get a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowChangeReply {
    /// Never reply (fire-and-forget)
    #[default]
    Never,
    /// Reply success when the peer asked for a reply
    IfRequested,
}
