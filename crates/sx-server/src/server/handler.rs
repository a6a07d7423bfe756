//! SSH client handler implementation
//!
//! Bridges russh's per-connection callbacks to the connection supervisor.
//! Each channel open becomes a [`RusshChannelOpen`] event, channel data is
//! piped through an in-process byte stream, and channel requests are
//! re-encoded into [`ControlRequest`]s whose replies are sent back through
//! the session handle.
//!
//! russh drives every callback of a connection from one loop, so nothing
//! here waits on a session. Peer data is queued per channel, up to
//! `INPUT_BUFFER_LIMIT` bytes, and written by a task of its own. Requests
//! go through a queue of `REQUEST_QUEUE_SIZE` slots; a request arriving
//! while it is full is answered with failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use sx_core::config::ServerConfig;
use sx_core::traits::{AcceptedChannel, ChannelOpen, RejectReason, SESSION_CHANNEL_TYPE};
use sx_core::ChannelError;
use sx_protocol::request::{ENV, EXEC, PTY_REQ, SHELL, SUBSYSTEM, WINDOW_CHANGE};
use sx_protocol::{
    put_string, window_change_payload, ControlRequest, PtyRequest, Reply, ScreenSize,
};

use crate::connection::memory::{REQUEST_QUEUE_SIZE, STREAM_BUFFER_SIZE};
use crate::connection::OpenOutcome;

/// Read size when forwarding session output
const OUTPUT_CHUNK_SIZE: usize = 8192;

/// Peer bytes a channel may queue ahead of its session
const INPUT_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// Channel-open event raised by a russh connection
pub struct RusshChannelOpen {
    channel_type: String,
    /// Stream and requests, present only for channel types we can carry
    pending: Option<AcceptedChannel>,
    decision: oneshot::Sender<OpenOutcome>,
}

#[async_trait]
impl ChannelOpen for RusshChannelOpen {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn accept(self) -> Result<AcceptedChannel, ChannelError> {
        match self.pending {
            Some(accepted) => {
                let _ = self.decision.send(OpenOutcome::Accepted);
                Ok(accepted)
            }
            None => {
                let _ = self.decision.send(OpenOutcome::Rejected {
                    reason: RejectReason::UnknownChannelType,
                    message: format!("unknown channel type: {}", self.channel_type),
                });
                Err(ChannelError::Accept(format!(
                    "{} channels cannot be carried",
                    self.channel_type
                )))
            }
        }
    }

    async fn reject(self, reason: RejectReason, message: String) {
        let _ = self.decision.send(OpenOutcome::Rejected { reason, message });
    }
}

/// Why peer data was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushError {
    /// The session stopped reading or the peer sent EOF
    Finished,
    /// The session is too far behind
    Overflow,
}

/// Peer data on its way into a session
///
/// Writes happen on a separate task, so queueing never waits.
struct InputPipe {
    chunks: Option<mpsc::UnboundedSender<Bytes>>,
    queued: Arc<AtomicUsize>,
    limit: usize,
}

impl InputPipe {
    fn spawn<W>(input: W, limit: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (chunks, chunk_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn(forward_input(input, chunk_rx, Arc::clone(&queued)));
        Self {
            chunks: Some(chunks),
            queued,
            limit,
        }
    }

    fn push(&self, data: &[u8]) -> Result<(), PushError> {
        let chunks = self.chunks.as_ref().ok_or(PushError::Finished)?;
        // Only the connection loop pushes, so the check and the add do not race
        if self.queued.load(Ordering::Acquire) + data.len() > self.limit {
            return Err(PushError::Overflow);
        }
        self.queued.fetch_add(data.len(), Ordering::AcqRel);
        chunks
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| PushError::Finished)
    }

    /// End the input once everything queued has been written
    fn finish(&mut self) {
        self.chunks = None;
    }
}

/// An open channel's plumbing
struct ChannelRoute {
    /// Peer data into the session
    input: InputPipe,
    /// Requests into the session's dispatcher
    requests: mpsc::Sender<ControlRequest>,
    /// Pending replies, answered in request order
    replies: mpsc::UnboundedSender<oneshot::Receiver<Reply>>,
    /// Task forwarding session output to the peer
    output: JoinHandle<()>,
}

/// Handler for a single SSH client connection
pub struct ClientHandler {
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Channel-open events for the supervisor
    channel_tx: mpsc::Sender<RusshChannelOpen>,
    /// Global requests for the supervisor
    global_tx: mpsc::Sender<ControlRequest>,
    /// Open channels
    channels: HashMap<ChannelId, ChannelRoute>,
}

impl ClientHandler {
    /// Create a handler feeding the given supervisor queues
    pub fn new(
        peer_addr: SocketAddr,
        channel_tx: mpsc::Sender<RusshChannelOpen>,
        global_tx: mpsc::Sender<ControlRequest>,
    ) -> Self {
        Self {
            peer_addr,
            channel_tx,
            global_tx,
            channels: HashMap::new(),
        }
    }

    /// Hand a channel open to the supervisor and wait for its decision
    async fn offer(&self, channel_type: &str, pending: Option<AcceptedChannel>) -> bool {
        let (decision_tx, decision_rx) = oneshot::channel();
        let open = RusshChannelOpen {
            channel_type: channel_type.to_string(),
            pending,
            decision: decision_tx,
        };

        if self.channel_tx.send(open).await.is_err() {
            tracing::warn!(
                "Supervisor for {} is gone, refusing {} channel",
                self.peer_addr,
                channel_type
            );
            return false;
        }

        match decision_rx.await {
            Ok(OpenOutcome::Accepted) => true,
            Ok(OpenOutcome::Rejected { reason, message }) => {
                // russh only lets us refuse; the reason code is not sent
                tracing::debug!(
                    "Refusing {} channel from {} (reason {}): {}",
                    channel_type,
                    self.peer_addr,
                    reason.code(),
                    message
                );
                false
            }
            Err(_) => false,
        }
    }

    /// Pass a channel request to its session and reply when it is decided
    async fn forward_request(
        &self,
        channel: ChannelId,
        request_type: &str,
        payload: Bytes,
        session: &mut Session,
    ) {
        let (request, reply_rx) = ControlRequest::new(request_type, payload, true);

        match self.channels.get(&channel) {
            Some(route) => {
                let _ = route.replies.send(reply_rx);
                if !queue_request(&route.requests, request) {
                    tracing::debug!("{} request on {:?} answered with failure", request_type, channel);
                }
            }
            None => {
                tracing::warn!(
                    "{} request from {} on unknown channel {:?}",
                    request_type,
                    self.peer_addr,
                    channel
                );
                session.channel_failure(channel);
                request.dismiss();
            }
        }
    }

    /// Pass a global request to the supervisor and wait for the answer
    async fn forward_global(&self, request_type: &str, payload: Bytes) -> bool {
        let (request, reply_rx) = ControlRequest::new(request_type, payload, true);
        if self.global_tx.send(request).await.is_err() {
            return false;
        }
        matches!(reply_rx.await, Ok(reply) if reply.success)
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        for (_, route) in self.channels.drain() {
            route.output.abort();
        }
    }
}

/// Queue a request for a session's dispatcher without waiting
///
/// A full or closed queue drops the request, which answers it `false`.
fn queue_request(requests: &mpsc::Sender<ControlRequest>, request: ControlRequest) -> bool {
    match requests.try_send(request) {
        Ok(()) => true,
        Err(TrySendError::Full(request)) => {
            tracing::warn!(
                "Refusing {} request: {} requests already waiting",
                request.request_type(),
                REQUEST_QUEUE_SIZE
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Write queued peer data into a session, then end its input
async fn forward_input<W>(
    mut input: W,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = chunks.recv().await {
        let written = input.write_all(&chunk).await;
        queued.fetch_sub(chunk.len(), Ordering::AcqRel);
        if let Err(e) = written {
            tracing::debug!("Session input closed: {}", e);
            return;
        }
    }
    let _ = input.shutdown().await;
}

/// Copy session output to the peer until the session side closes
async fn forward_output<R>(handle: Handle, channel: ChannelId, mut output: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match output.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if handle
                    .data(channel, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    tracing::debug!("Connection closed while sending on {:?}", channel);
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("Output for {:?} failed: {}", channel, e);
                break;
            }
        }
    }

    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

/// Send request replies to the peer in the order the requests arrived
async fn forward_replies(
    handle: Handle,
    channel: ChannelId,
    mut replies: mpsc::UnboundedReceiver<oneshot::Receiver<Reply>>,
) {
    while let Some(reply_rx) = replies.recv().await {
        // A dismissed request drops the sender and gets no reply
        let Ok(reply) = reply_rx.await else {
            continue;
        };
        let sent = if reply.success {
            handle.channel_success(channel).await
        } else {
            handle.channel_failure(channel).await
        };
        if sent.is_err() {
            tracing::trace!("Reply for {:?} not sent: connection closed", channel);
            break;
        }
    }
}

fn string_payload(fields: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    for field in fields {
        put_string(&mut buf, field);
    }
    buf.freeze()
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Clients are not authenticated
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::info!("Accepting {} from {} without authentication", user, self.peer_addr);
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::info!(
            "Accepting {} from {}, key fingerprint: {}",
            user,
            self.peer_addr,
            public_key.fingerprint()
        );
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        tracing::debug!("Session channel requested: {:?}", channel_id);

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let pending = AcceptedChannel {
            stream: Box::new(local),
            requests: request_rx,
        };

        if !self.offer(SESSION_CHANNEL_TYPE, Some(pending)).await {
            return Ok(false);
        }

        let (output, input) = tokio::io::split(remote);
        let output = tokio::spawn(forward_output(session.handle(), channel_id, output));
        let input = InputPipe::spawn(input, INPUT_BUFFER_LIMIT);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_replies(session.handle(), channel_id, reply_rx));
        self.channels.insert(
            channel_id,
            ChannelRoute {
                input,
                requests: request_tx,
                replies: reply_tx,
                output,
            },
        );

        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("direct-tcpip to {}:{} requested", host_to_connect, port_to_connect);
        Ok(self.offer("direct-tcpip", None).await)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.offer("x11", None).await)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);

        if let Some(route) = self.channels.get_mut(&channel) {
            match route.input.push(data) {
                Ok(()) => {}
                Err(PushError::Finished) => {
                    tracing::trace!("Dropping input for finished channel {:?}", channel);
                }
                Err(PushError::Overflow) => {
                    tracing::warn!(
                        "Closing {:?}: session is {} bytes behind on input",
                        channel,
                        INPUT_BUFFER_LIMIT
                    );
                    route.input.finish();
                    session.close(channel);
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if let Some(route) = self.channels.get_mut(&channel) {
            route.input.finish();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);

        // Dropping the request sender ends the session
        if let Some(route) = self.channels.remove(&channel) {
            route.output.abort();
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, SHELL, Bytes::new(), session).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = PtyRequest::new(term, ScreenSize::new(col_width, row_height)).encode();
        self.forward_request(channel, PTY_REQ, payload, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = window_change_payload(ScreenSize::new(col_width, row_height));
        self.forward_request(channel, WINDOW_CHANGE, payload, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, EXEC, string_payload(&[data]), session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = string_payload(&[name.as_bytes()]);
        self.forward_request(channel, SUBSYSTEM, payload, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = string_payload(&[variable_name.as_bytes(), variable_value.as_bytes()]);
        self.forward_request(channel, ENV, payload, session).await;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, address.as_bytes());
        payload.put_u32(*port);
        Ok(self.forward_global("tcpip-forward", payload.freeze()).await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, address.as_bytes());
        payload.put_u32(port);
        Ok(self.forward_global("cancel-tcpip-forward", payload.freeze()).await)
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct SshConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl SshConfig {
    /// Create the russh configuration for a host key and server settings
    pub fn new(host_key: russh_keys::key::KeyPair, config: &ServerConfig) -> Self {
        let mut ssh_config = russh::server::Config::default();
        ssh_config.keys.push(host_key);
        ssh_config.auth_rejection_time = config.auth_rejection_time;
        ssh_config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(ssh_config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use std::time::Duration;
    use tokio::time::timeout;

    fn open_event(
        pending: Option<AcceptedChannel>,
    ) -> (RusshChannelOpen, oneshot::Receiver<OpenOutcome>) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let open = RusshChannelOpen {
            channel_type: if pending.is_some() { "session" } else { "x11" }.to_string(),
            pending,
            decision: decision_tx,
        };
        (open, decision_rx)
    }

    #[tokio::test]
    async fn test_accept_hands_over_stream() {
        let (local, _remote) = tokio::io::duplex(64);
        let (_request_tx, request_rx) = mpsc::channel(1);
        let (open, decision_rx) = open_event(Some(AcceptedChannel {
            stream: Box::new(local),
            requests: request_rx,
        }));

        assert_eq!(open.channel_type(), "session");
        assert!(open.accept().await.is_ok());
        assert_eq!(decision_rx.await.unwrap(), OpenOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_accept_without_stream_refuses() {
        let (open, decision_rx) = open_event(None);
        assert!(matches!(open.accept().await, Err(ChannelError::Accept(_))));
        assert!(matches!(
            decision_rx.await.unwrap(),
            OpenOutcome::Rejected {
                reason: RejectReason::UnknownChannelType,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reject_passes_reason() {
        let (open, decision_rx) = open_event(None);
        open.reject(RejectReason::ResourceShortage, "full".to_string()).await;
        assert_eq!(
            decision_rx.await.unwrap(),
            OpenOutcome::Rejected {
                reason: RejectReason::ResourceShortage,
                message: "full".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_input_push_never_waits_on_session() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let mut pipe = InputPipe::spawn(writer, INPUT_BUFFER_LIMIT);

        // Far more than the stream holds, with nobody reading yet
        let chunk = vec![7u8; 32 * 1024];
        for _ in 0..8 {
            pipe.push(&chunk).unwrap();
        }
        pipe.finish();
        assert_eq!(pipe.push(b"late"), Err(PushError::Finished));

        let mut received = Vec::new();
        timeout(Duration::from_secs(1), reader.read_to_end(&mut received))
            .await
            .expect("input never ended")
            .unwrap();
        assert_eq!(received.len(), 8 * chunk.len());
        assert!(received.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn test_input_overflow_until_session_reads() {
        let (writer, mut reader) = tokio::io::duplex(16);
        let pipe = InputPipe::spawn(writer, 64);

        pipe.push(&[1u8; 48]).unwrap();
        assert_eq!(pipe.push(&[2u8; 32]), Err(PushError::Overflow));

        let mut buf = [0u8; 48];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1u8; 48]);

        timeout(Duration::from_secs(1), async {
            while pipe.push(&[2u8; 32]).is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued input was never released");

        let mut buf = [0u8; 32];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [2u8; 32]);
    }

    #[tokio::test]
    async fn test_input_after_session_stops_reading() {
        let (writer, reader) = tokio::io::duplex(16);
        let pipe = InputPipe::spawn(writer, INPUT_BUFFER_LIMIT);
        drop(reader);

        timeout(Duration::from_secs(1), async {
            while pipe.push(b"x") != Err(PushError::Finished) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("input never noticed the session was gone");
    }

    #[tokio::test]
    async fn test_full_request_queue_fails_request() {
        let (requests, mut request_rx) = mpsc::channel(1);

        let (first, _first_reply) = ControlRequest::new(SHELL, Bytes::new(), true);
        assert!(queue_request(&requests, first));

        let (second, second_reply) = ControlRequest::new(PTY_REQ, Bytes::new(), true);
        assert!(!queue_request(&requests, second));
        assert!(!second_reply.await.unwrap().success);

        let queued = request_rx.recv().await.unwrap();
        assert_eq!(queued.request_type(), SHELL);
        queued.reply(true);

        drop(request_rx);
        let (third, third_reply) = ControlRequest::new(SHELL, Bytes::new(), true);
        assert!(!queue_request(&requests, third));
        assert!(!third_reply.await.unwrap().success);
    }

    #[test]
    fn test_string_payload() {
        let mut payload = string_payload(&[b"TERM", b"xterm"]);
        assert_eq!(payload.len(), 4 + 4 + 4 + 5);
        assert_eq!(payload.get_u32(), 4);
        assert_eq!(&payload[..4], b"TERM");
        payload.advance(4);
        assert_eq!(payload.get_u32(), 5);
        assert_eq!(&payload[..], b"xterm");
    }

    #[test]
    fn test_ssh_config_uses_server_settings() {
        let key = russh_keys::key::KeyPair::generate_ed25519().unwrap();
        let config = ServerConfig {
            auth_rejection_time: std::time::Duration::from_secs(3),
            ..ServerConfig::default()
        };
        let ssh = SshConfig::new(key, &config);
        assert_eq!(ssh.ssh_config.keys.len(), 1);
        assert_eq!(ssh.ssh_config.auth_rejection_time, std::time::Duration::from_secs(3));
    }
}
