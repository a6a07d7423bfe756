//! Channel and global request envelope
//!
//! Every inbound request carries a type tag and an opaque payload. A request
//! that wants a reply holds the sending half of a oneshot; the reply methods
//! consume the request so at most one reply can be sent.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;

/// `shell` request type
pub const SHELL: &str = "shell";
/// `pty-req` request type
pub const PTY_REQ: &str = "pty-req";
/// `window-change` request type
pub const WINDOW_CHANGE: &str = "window-change";
/// `exec` request type
pub const EXEC: &str = "exec";
/// `subsystem` request type
pub const SUBSYSTEM: &str = "subsystem";
/// `env` request type
pub const ENV: &str = "env";

/// Request types the dispatcher knows how to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Start a shell
    Shell,
    /// Allocate a pseudo-terminal
    PtyReq,
    /// Terminal was resized
    WindowChange,
    /// Anything else
    Other,
}

impl RequestKind {
    /// Classify a request type tag
    pub fn from_type(request_type: &str) -> Self {
        match request_type {
            SHELL => RequestKind::Shell,
            PTY_REQ => RequestKind::PtyReq,
            WINDOW_CHANGE => RequestKind::WindowChange,
            _ => RequestKind::Other,
        }
    }
}

/// Reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Whether the request was accepted
    pub success: bool,
    /// Optional reply payload
    pub payload: Option<Bytes>,
}

/// An inbound request awaiting a decision
#[derive(Debug)]
pub struct ControlRequest {
    request_type: String,
    payload: Bytes,
    want_reply: bool,
    reply_tx: Option<oneshot::Sender<Reply>>,
}

impl ControlRequest {
    /// Create a request and the receiver its reply will arrive on
    ///
    /// When `want_reply` is false the receiver resolves with an error as soon
    /// as the request is consumed.
    pub fn new(
        request_type: impl Into<String>,
        payload: impl Into<Bytes>,
        want_reply: bool,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Self {
            request_type: request_type.into(),
            payload: payload.into(),
            want_reply,
            reply_tx: want_reply.then_some(reply_tx),
        };
        (request, reply_rx)
    }

    /// Request type tag
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Classified request type
    pub fn kind(&self) -> RequestKind {
        RequestKind::from_type(&self.request_type)
    }

    /// Raw payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the peer asked for a reply
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Reply without a payload
    pub fn reply(self, success: bool) {
        self.reply_with(success, None);
    }

    /// Reply with an optional payload
    pub fn reply_with(mut self, success: bool, payload: Option<Bytes>) {
        if let Some(reply_tx) = self.reply_tx.take() {
            if reply_tx.send(Reply { success, payload }).is_err() {
                tracing::trace!("Reply to {} request dropped: peer gone", self.request_type);
            }
        }
    }

    /// Consume the request without replying
    pub fn dismiss(mut self) {
        self.reply_tx.take();
    }
}

impl Drop for ControlRequest {
    fn drop(&mut self) {
        if let Some(reply_tx) = self.reply_tx.take() {
            tracing::debug!("Unanswered {} request, replying failure", self.request_type);
            let _ = reply_tx.send(Reply {
                success: false,
                payload: None,
            });
        }
    }
}

/// Append an SSH string (u32 big-endian length, then bytes)
pub fn put_string(dst: &mut BytesMut, data: &[u8]) {
    dst.reserve(4 + data.len());
    dst.put_u32(data.len() as u32);
    dst.extend_from_slice(data);
}
