//! Channel acceptor
//!
//! Turns accepted `session` channels into sessions and starts their handler
//! and request dispatcher. Every other channel type is rejected.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use sx_core::config::SessionConfig;
use sx_core::traits::{AcceptedChannel, ChannelOpen, RejectReason, SESSION_CHANNEL_TYPE};
use sx_core::ChannelError;
use sx_protocol::SessionId;

use crate::session::{RequestDispatcher, Session, SessionHandler, SessionRegistry};

/// Accepts channels for one connection
pub struct ChannelAcceptor {
    /// Application handler run for every session
    handler: Arc<dyn SessionHandler>,
    /// Session settings
    config: SessionConfig,
    /// Registry of open sessions
    registry: Arc<SessionRegistry>,
    /// Open channel slots, if capped
    channel_slots: Option<(Arc<Semaphore>, u32)>,
}

impl ChannelAcceptor {
    /// Create an acceptor with no channel limit
    pub fn new(
        handler: Arc<dyn SessionHandler>,
        config: SessionConfig,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            handler,
            config,
            registry,
            channel_slots: None,
        }
    }

    /// Limit the number of sessions open at once through this acceptor
    pub fn with_channel_limit(mut self, limit: Option<u32>) -> Self {
        self.channel_slots = limit.map(|limit| (Arc::new(Semaphore::new(limit as usize)), limit));
        self
    }

    /// Accept or reject one channel-open event
    pub async fn accept<O: ChannelOpen>(&self, open: O) -> Result<SessionId, ChannelError> {
        let channel_type = open.channel_type().to_string();
        if channel_type != SESSION_CHANNEL_TYPE {
            let message = format!("unknown channel type: {}", channel_type);
            open.reject(RejectReason::UnknownChannelType, message).await;
            return Err(ChannelError::UnknownChannelType(channel_type));
        }

        let permit = match &self.channel_slots {
            Some((slots, limit)) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    open.reject(
                        RejectReason::ResourceShortage,
                        format!("too many channels (limit {})", limit),
                    )
                    .await;
                    return Err(ChannelError::LimitExceeded { limit: *limit });
                }
            },
            None => None,
        };

        let AcceptedChannel { stream, requests } = open.accept().await?;

        let (resize_tx, resize_rx) = mpsc::channel(self.config.resize_capacity());
        let session = Session::new(
            SessionId::generate(),
            stream,
            resize_rx,
            self.config.farewell.clone(),
        );
        let id = session.id();
        self.registry.insert(session.clone());

        tracing::info!("Client {} connected", id);

        // Application side
        let handler = Arc::clone(&self.handler);
        let handler_session = session.clone();
        tokio::spawn(async move {
            handler.handle(handler_session).await;
            tracing::debug!("Handler finished for {}", id);
        });

        // Protocol side
        let dispatcher = RequestDispatcher::new(session.clone(), resize_tx, &self.config);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = dispatcher.run(requests).await {
                tracing::warn!("Session {} ended with error: {}", id, e);
            }

            // No more requests means the channel is gone
            session.close().await;
            registry.remove(&id);
            tracing::info!("Client {} disconnected", id);
        });

        Ok(id)
    }
}
