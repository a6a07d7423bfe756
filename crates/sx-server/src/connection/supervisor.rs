//! Connection supervisor
//!
//! Drives one connection after its handshake: global requests are refused,
//! and every channel-open event is handed to the acceptor on its own task so
//! a slow channel never holds up the next one.

use std::sync::Arc;

use futures::{Stream, StreamExt};

use sx_core::traits::ChannelOpen;
use sx_core::ChannelError;
use sx_protocol::ControlRequest;

use super::ChannelAcceptor;

/// Per-connection supervisor
pub struct ConnectionSupervisor {
    /// Acceptor shared by this connection's channels
    acceptor: Arc<ChannelAcceptor>,
    /// Remote peer, for logging
    peer: String,
}

impl ConnectionSupervisor {
    /// Create a supervisor for one connection
    pub fn new(acceptor: ChannelAcceptor, peer: impl Into<String>) -> Self {
        Self {
            acceptor: Arc::new(acceptor),
            peer: peer.into(),
        }
    }

    /// Serve the connection until its channel-open stream ends
    pub async fn run<C, O, G>(self, mut channels: C, global_requests: G)
    where
        C: Stream<Item = O> + Unpin,
        O: ChannelOpen,
        G: Stream<Item = ControlRequest> + Send + Unpin + 'static,
    {
        tracing::debug!("Supervising connection from {}", self.peer);
        tokio::spawn(discard_requests(global_requests));

        while let Some(open) = channels.next().await {
            let acceptor = Arc::clone(&self.acceptor);
            let peer = self.peer.clone();

            tokio::spawn(async move {
                let channel_type = open.channel_type().to_string();
                match acceptor.accept(open).await {
                    Ok(id) => {
                        tracing::debug!("Session {} opened on connection from {}", id, peer);
                    }
                    Err(ChannelError::UnknownChannelType(t)) => {
                        tracing::info!("Rejected {} channel from {}", t, peer);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Could not open {} channel from {}: {}",
                            channel_type,
                            peer,
                            e
                        );
                    }
                }
            });
        }

        tracing::debug!("Connection from {} has no more channels", self.peer);
    }
}

/// Refuse every request in the stream
pub async fn discard_requests<G>(mut requests: G)
where
    G: Stream<Item = ControlRequest> + Unpin,
{
    while let Some(request) = requests.next().await {
        tracing::debug!("Discarding global request {}", request.request_type());
        request.reply(false);
    }
}
