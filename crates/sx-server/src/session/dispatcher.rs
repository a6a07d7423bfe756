//! Channel request dispatcher
//!
//! Consumes the requests sent on one session channel, in arrival order, and
//! answers each one:
//!
//! | request         | reply                                   |
//! |-----------------|-----------------------------------------|
//! | `shell`         | success if the payload is empty         |
//! | `pty-req`       | success once the size is decoded        |
//! | `window-change` | per [`WindowChangeReply`]               |
//! | anything else   | failure                                 |
//!
//! Sizes from `pty-req` and `window-change` are pushed onto the session's
//! resize queue. A payload that cannot be decoded is answered with failure
//! and closes the session.

use std::time::Duration;

use tokio::sync::mpsc;

use sx_core::config::{SessionConfig, WindowChangeReply};
use sx_core::ChannelError;
use sx_protocol::{ControlRequest, PtyRequest, RequestKind, ScreenSize};

use super::Session;

/// Per-session request dispatcher
pub struct RequestDispatcher {
    session: Session,
    resizes: mpsc::Sender<ScreenSize>,
    window_change_reply: WindowChangeReply,
    resize_wait: Option<Duration>,
}

impl RequestDispatcher {
    /// Create a dispatcher feeding `resizes`, the sending half of the
    /// session's resize queue
    pub fn new(
        session: Session,
        resizes: mpsc::Sender<ScreenSize>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            session,
            resizes,
            window_change_reply: config.window_change_reply,
            resize_wait: config.resize_wait(),
        }
    }

    /// Process requests until the stream ends or the session closes
    ///
    /// The resize queue is closed when this returns.
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<ControlRequest>,
    ) -> Result<(), ChannelError> {
        let id = self.session.id();
        tracing::debug!("Request dispatcher started for {}", id);

        loop {
            let request = tokio::select! {
                _ = self.session.closed() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if let Err(e) = self.dispatch(request).await {
                tracing::warn!("Terminating session {}: {}", id, e);
                self.session.close().await;
                return Err(e);
            }
        }

        tracing::debug!("Request dispatcher stopped for {}", id);
        Ok(())
    }

    async fn dispatch(&self, request: ControlRequest) -> Result<(), ChannelError> {
        let id = self.session.id();
        tracing::debug!(
            "Request {} on {} ({} bytes)",
            request.request_type(),
            id,
            request.payload().len()
        );

        match request.kind() {
            RequestKind::Shell => {
                let ok = request.payload().is_empty();
                request.reply(ok);
            }

            RequestKind::PtyReq => {
                let pty = match PtyRequest::decode(request.payload()) {
                    Ok(pty) => pty,
                    Err(e) => {
                        request.reply(false);
                        return Err(e.into());
                    }
                };
                tracing::debug!("Pty for {}: term={} size={}", id, pty.term, pty.size);
                self.push_resize(pty.size).await;
                request.reply(true);
            }

            RequestKind::WindowChange => {
                let size = match ScreenSize::decode(request.payload()) {
                    Ok(size) => size,
                    Err(e) => {
                        request.reply(false);
                        return Err(e.into());
                    }
                };
                self.push_resize(size).await;
                match self.window_change_reply {
                    WindowChangeReply::Never => request.dismiss(),
                    WindowChangeReply::IfRequested => request.reply(true),
                }
            }

            RequestKind::Other => {
                tracing::debug!("Ignoring {} request on {}", request.request_type(), id);
                request.reply(false);
            }
        }

        Ok(())
    }

    /// Hand a size to the consumer, giving up when the session closes or the
    /// wait limit elapses
    async fn push_resize(&self, size: ScreenSize) {
        if self.session.is_closed() {
            return;
        }

        let send = async {
            match self.resize_wait {
                Some(wait) => match tokio::time::timeout(wait, self.resizes.send(size)).await {
                    Ok(result) => result.is_ok(),
                    Err(_) => {
                        tracing::warn!(
                            "Resize {} for {} dropped: consumer not reading",
                            size,
                            self.session.id()
                        );
                        false
                    }
                },
                None => self.resizes.send(size).await.is_ok(),
            }
        };

        tokio::select! {
            _ = self.session.closed() => {}
            delivered = send => {
                if delivered {
                    tracing::trace!("Resize {} queued for {}", size, self.session.id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sx_protocol::request::{EXEC, PTY_REQ, SHELL, WINDOW_CHANGE};
    use sx_protocol::{window_change_payload, Reply, SessionId};
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct Harness {
        session: Session,
        requests: mpsc::Sender<ControlRequest>,
        task: JoinHandle<Result<(), ChannelError>>,
        _remote: DuplexStream,
    }

    fn start(config: SessionConfig) -> Harness {
        let (local, remote) = tokio::io::duplex(256);
        let (resize_tx, resize_rx) = mpsc::channel(config.resize_capacity());
        let session = Session::new(SessionId::generate(), Box::new(local), resize_rx, "bye\n\r");
        let (request_tx, request_rx) = mpsc::channel(8);

        let dispatcher = RequestDispatcher::new(session.clone(), resize_tx, &config);
        let task = tokio::spawn(dispatcher.run(request_rx));

        Harness {
            session,
            requests: request_tx,
            task,
            _remote: remote,
        }
    }

    async fn send(
        harness: &Harness,
        request_type: &str,
        payload: impl Into<Bytes>,
    ) -> oneshot::Receiver<Reply> {
        let (request, reply_rx) = ControlRequest::new(request_type, payload, true);
        harness.requests.send(request).await.unwrap();
        reply_rx
    }

    async fn reply(reply_rx: oneshot::Receiver<Reply>) -> Option<bool> {
        timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("no reply in time")
            .ok()
            .map(|r| r.success)
    }

    #[tokio::test]
    async fn test_shell_empty_payload_accepted() {
        let harness = start(SessionConfig::default());
        let rx = send(&harness, SHELL, Bytes::new()).await;
        assert_eq!(reply(rx).await, Some(true));
    }

    #[tokio::test]
    async fn test_shell_with_payload_rejected() {
        let harness = start(SessionConfig::default());
        let rx = send(&harness, SHELL, Bytes::from_static(b"bash")).await;
        assert_eq!(reply(rx).await, Some(false));
    }

    #[tokio::test]
    async fn test_pty_req_pushes_size_then_replies() {
        let harness = start(SessionConfig::default());
        let payload = vec![
            0, 0, 0, 3, b'x', b't', b'y', 0, 0, 0, 80, 0, 0, 0, 24, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let rx = send(&harness, PTY_REQ, payload).await;

        assert_eq!(reply(rx).await, Some(true));
        assert_eq!(
            harness.session.next_resize().await,
            Some(ScreenSize::new(80, 24))
        );
    }

    #[tokio::test]
    async fn test_window_change_not_replied_by_default() {
        let harness = start(SessionConfig::default());
        let rx = send(
            &harness,
            WINDOW_CHANGE,
            window_change_payload(ScreenSize::new(120, 40)),
        )
        .await;

        assert_eq!(reply(rx).await, None);
        assert_eq!(
            harness.session.next_resize().await,
            Some(ScreenSize::new(120, 40))
        );
    }

    #[tokio::test]
    async fn test_window_change_replied_when_configured() {
        let config = SessionConfig {
            window_change_reply: WindowChangeReply::IfRequested,
            ..SessionConfig::default()
        };
        let harness = start(config);
        let rx = send(
            &harness,
            WINDOW_CHANGE,
            window_change_payload(ScreenSize::new(90, 20)),
        )
        .await;

        assert_eq!(reply(rx).await, Some(true));
        assert_eq!(
            harness.session.next_resize().await,
            Some(ScreenSize::new(90, 20))
        );
    }

    #[tokio::test]
    async fn test_unknown_request_rejected() {
        let harness = start(SessionConfig::default());
        let rx = send(&harness, EXEC, Bytes::from_static(b"\0\0\0\x02ls")).await;
        assert_eq!(reply(rx).await, Some(false));
        assert!(!harness.session.is_closed());
    }

    #[tokio::test]
    async fn test_resizes_in_request_order() {
        let harness = start(SessionConfig::default());
        for width in [80u32, 100, 120] {
            let (request, _) = ControlRequest::new(
                WINDOW_CHANGE,
                window_change_payload(ScreenSize::new(width, 24)),
                false,
            );
            harness.requests.send(request).await.unwrap();
        }

        for width in [80u32, 100, 120] {
            assert_eq!(
                harness.session.next_resize().await,
                Some(ScreenSize::new(width, 24))
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_window_change_terminates() {
        let harness = start(SessionConfig::default());
        let rx = send(&harness, WINDOW_CHANGE, vec![0, 0, 0, 80]).await;
        assert_eq!(reply(rx).await, Some(false));

        let result = timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Protocol(_))));
        assert!(harness.session.is_closed());
        assert_eq!(harness.session.next_resize().await, None);
    }

    #[tokio::test]
    async fn test_malformed_pty_req_terminates() {
        let harness = start(SessionConfig::default());
        let rx = send(&harness, PTY_REQ, vec![0, 0]).await;
        assert_eq!(reply(rx).await, Some(false));

        let result = timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_stream_end_closes_resize_queue() {
        let Harness {
            session,
            requests,
            task,
            _remote,
        } = start(SessionConfig::default());
        drop(requests);

        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(session.next_resize().await, None);
    }

    #[tokio::test]
    async fn test_session_close_stops_dispatcher() {
        let harness = start(SessionConfig::default());
        harness.session.close().await;

        let result = timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_resize_dropped_after_timeout() {
        let config = SessionConfig {
            resize_buffer: 1,
            resize_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        let harness = start(config);

        // First size fills the queue, second waits for room and is dropped
        let first = send(
            &harness,
            PTY_REQ,
            PtyRequest::new("vt100", ScreenSize::new(80, 24)).encode(),
        )
        .await;
        assert_eq!(reply(first).await, Some(true));
        let second = send(
            &harness,
            PTY_REQ,
            PtyRequest::new("vt100", ScreenSize::new(81, 25)).encode(),
        )
        .await;
        assert_eq!(reply(second).await, Some(true));

        assert_eq!(
            harness.session.next_resize().await,
            Some(ScreenSize::new(80, 24))
        );
        let shell = send(&harness, SHELL, Bytes::new()).await;
        assert_eq!(reply(shell).await, Some(true));
        drop(harness.requests);
        assert_eq!(harness.session.next_resize().await, None);
    }

    #[tokio::test]
    async fn test_reply_waits_for_consumer_without_timeout() {
        let config = SessionConfig {
            resize_buffer: 1,
            resize_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        let harness = start(config);

        let first = send(
            &harness,
            PTY_REQ,
            PtyRequest::new("vt100", ScreenSize::new(80, 24)).encode(),
        )
        .await;
        assert_eq!(reply(first).await, Some(true));

        // Queue is full: the second reply is held back until the consumer reads
        let (request, mut second) = ControlRequest::new(
            PTY_REQ,
            PtyRequest::new("vt100", ScreenSize::new(100, 30)).encode(),
            true,
        );
        harness.requests.send(request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.try_recv().is_err());

        assert_eq!(
            harness.session.next_resize().await,
            Some(ScreenSize::new(80, 24))
        );
        assert_eq!(reply(second).await, Some(true));
        assert_eq!(
            harness.session.next_resize().await,
            Some(ScreenSize::new(100, 30))
        );
    }
}
