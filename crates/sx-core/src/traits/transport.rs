//! Transport boundary traits
//!
//! The SSH transport hands the server one `ChannelOpen` per channel the peer
//! tries to open. Accepting it yields the channel's byte stream and the
//! stream of requests sent on it.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use sx_protocol::ControlRequest;

use crate::error::ChannelError;

/// Channel type served by the session server
pub const SESSION_CHANNEL_TYPE: &str = "session";

/// A bidirectional byte stream to the remote peer
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed byte stream
pub type ByteStream = Box<dyn DuplexStream>;

/// Reason codes for rejecting a channel open (RFC 4254 §5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Administratively prohibited
    AdministrativelyProhibited,
    /// Connect failed
    ConnectFailed,
    /// Unknown channel type
    UnknownChannelType,
    /// Resource shortage
    ResourceShortage,
}

impl RejectReason {
    /// Wire reason code
    pub fn code(&self) -> u32 {
        match self {
            RejectReason::AdministrativelyProhibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }
}

/// An accepted channel
pub struct AcceptedChannel {
    /// Channel data stream
    pub stream: ByteStream,
    /// Requests sent on the channel, ends when the channel closes
    pub requests: mpsc::Receiver<ControlRequest>,
}

/// A pending channel-open request from the peer
#[async_trait]
pub trait ChannelOpen: Send + 'static {
    /// Channel type requested by the peer
    fn channel_type(&self) -> &str;

    /// Accept the channel
    async fn accept(self) -> Result<AcceptedChannel, ChannelError>;

    /// Reject the channel with a reason and a human-readable message
    async fn reject(self, reason: RejectReason, message: String);
}
