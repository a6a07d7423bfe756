//! In-memory transport
//!
//! Channels that never touch the network: the server side implements
//! [`ChannelOpen`], the peer side holds the other end of the byte stream and
//! the sender for requests. Useful for loopback clients and tests.

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

use sx_core::traits::{AcceptedChannel, ChannelOpen, RejectReason};
use sx_core::ChannelError;
use sx_protocol::ControlRequest;

pub use super::OpenOutcome;

/// Byte buffer size of each in-memory stream direction
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the in-memory request queue
pub const REQUEST_QUEUE_SIZE: usize = 16;

/// Server side of an in-memory channel open
pub struct MemoryChannelOpen {
    channel_type: String,
    stream: DuplexStream,
    requests: mpsc::Receiver<ControlRequest>,
    outcome: oneshot::Sender<OpenOutcome>,
}

/// Peer side of an in-memory channel
pub struct MemoryPeer {
    remote: MemoryRemote,
    outcome: oneshot::Receiver<OpenOutcome>,
}

/// Peer's handles on an in-memory channel
pub struct MemoryRemote {
    /// Bytes to and from the session
    pub stream: DuplexStream,
    /// Requests to the session; dropping this closes the channel
    pub requests: mpsc::Sender<ControlRequest>,
}

/// Create a channel-open event of the given type and its peer
pub fn channel_pair(channel_type: impl Into<String>) -> (MemoryChannelOpen, MemoryPeer) {
    let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let open = MemoryChannelOpen {
        channel_type: channel_type.into(),
        stream: local,
        requests: request_rx,
        outcome: outcome_tx,
    };
    let peer = MemoryPeer {
        remote: MemoryRemote {
            stream: remote,
            requests: request_tx,
        },
        outcome: outcome_rx,
    };
    (open, peer)
}

impl MemoryPeer {
    /// Wait for the server's decision
    ///
    /// Returns `None` if the open event was dropped undecided.
    pub async fn outcome(&mut self) -> Option<OpenOutcome> {
        (&mut self.outcome).await.ok()
    }

    /// Take the peer's stream and request sender
    pub fn into_remote(self) -> MemoryRemote {
        self.remote
    }
}

#[async_trait]
impl ChannelOpen for MemoryChannelOpen {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn accept(self) -> Result<AcceptedChannel, ChannelError> {
        let _ = self.outcome.send(OpenOutcome::Accepted);
        Ok(AcceptedChannel {
            stream: Box::new(self.stream),
            requests: self.requests,
        })
    }

    async fn reject(self, reason: RejectReason, message: String) {
        let _ = self.outcome.send(OpenOutcome::Rejected { reason, message });
    }
}
