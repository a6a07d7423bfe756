//! Per-channel client session
//!
//! A `Session` bundles the channel's byte stream, the resize events decoded
//! from its requests, and an identity used for logging. It is cheap to clone;
//! all clones share the same stream.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use sx_core::traits::ByteStream;
use sx_core::SessionError;
use sx_protocol::{ScreenSize, SessionId};

/// How long `disconnect` waits to deliver the farewell
const FAREWELL_TIMEOUT: Duration = Duration::from_millis(250);

/// Handle to a connected client
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    reader: Mutex<ReadHalf<ByteStream>>,
    writer: Mutex<WriteHalf<ByteStream>>,
    resizes: Mutex<mpsc::Receiver<ScreenSize>>,
    /// Set once by the first close or disconnect
    closing: AtomicBool,
    /// Cancelled when the session is closed
    closed: CancellationToken,
    farewell: Bytes,
}

impl Session {
    /// Create a session over an accepted channel
    pub fn new(
        id: SessionId,
        stream: ByteStream,
        resizes: mpsc::Receiver<ScreenSize>,
        farewell: impl Into<Bytes>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        Self {
            inner: Arc::new(SessionInner {
                id,
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                resizes: Mutex::new(resizes),
                closing: AtomicBool::new(false),
                closed: CancellationToken::new(),
                farewell: farewell.into(),
            }),
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Read bytes sent by the client
    ///
    /// Returns `Ok(0)` when the client closed its side of the stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(SessionError::Closed),
            result = reader.read(buf) => Ok(result?),
        }
    }

    /// Write bytes to the client
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.write_raw(data).await
    }

    /// Wait for the next terminal resize
    ///
    /// Returns `None` once the channel's requests are no longer processed.
    pub async fn next_resize(&self) -> Option<ScreenSize> {
        self.inner.resizes.lock().await.recv().await
    }

    /// Say goodbye and close the stream
    ///
    /// The stream is closed even when the farewell cannot be written in
    /// time. Only the first call has an effect; later calls return `Ok(())`.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Client {} hanging up", self.inner.id);

        // A write blocked on a peer that stopped reading holds the writer
        // until `closed` is cancelled, so the farewell only gets a short try
        let farewell = self.write_raw(&self.inner.farewell);
        let result = match tokio::time::timeout(FAREWELL_TIMEOUT, farewell).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Farewell to {} not delivered in time", self.inner.id);
                Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "farewell not delivered",
                )))
            }
        };
        self.inner.closed.cancel();
        self.shutdown_writer().await;
        result
    }

    /// Close the stream without a farewell
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("Closing session {}", self.inner.id);
        self.inner.closed.cancel();
        self.shutdown_writer().await;
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    async fn write_raw(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.inner.writer.lock().await;
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(SessionError::Closed),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => Ok(result?),
        }
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Stream shutdown for {} failed: {}", self.inner.id, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    fn test_session() -> (Session, DuplexStream, mpsc::Sender<ScreenSize>) {
        let (local, remote) = tokio::io::duplex(1024);
        let (resize_tx, resize_rx) = mpsc::channel(4);
        let session = Session::new(SessionId::generate(), Box::new(local), resize_rx, "bye\n\r");
        (session, remote, resize_tx)
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (session, mut remote, _resize_tx) = test_session();
        session.write(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_read_from_peer() {
        let (session, mut remote, _resize_tx) = test_session();
        remote.write_all(b"ls\r").await.unwrap();

        let mut buf = [0u8; 16];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ls\r");
    }

    #[tokio::test]
    async fn test_read_eof() {
        let (session, remote, _resize_tx) = test_session();
        drop(remote);

        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_sends_farewell_and_closes() {
        let (session, mut remote, _resize_tx) = test_session();
        session.disconnect().await.unwrap();
        assert!(session.is_closed());

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye\n\r");

        let mut buf = [0u8; 4];
        assert!(matches!(
            session.read(&mut buf).await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(
            session.write(b"late").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let (session, mut remote, _resize_tx) = test_session();
        let other = session.clone();

        let (first, second) = tokio::join!(session.disconnect(), other.disconnect());
        assert!(first.is_ok());
        assert!(second.is_ok());

        // Farewell is written exactly once
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye\n\r");
    }

    #[tokio::test]
    async fn test_disconnect_wakes_pending_read() {
        let (session, _remote, _resize_tx) = test_session();
        let reader = session.clone();

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });

        tokio::task::yield_now().await;
        session.disconnect().await.unwrap();

        let result = timeout(Duration::from_secs(1), pending)
            .await
            .expect("read was not woken")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_disconnect_behind_blocked_write() {
        let (local, mut remote) = tokio::io::duplex(8);
        let (_resize_tx, resize_rx) = mpsc::channel(1);
        let session = Session::new(SessionId::generate(), Box::new(local), resize_rx, "bye\n\r");

        // The peer never reads, so this write fills the buffer and stalls
        let writer = session.clone();
        let blocked = tokio::spawn(async move { writer.write(&[b'x'; 64]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = timeout(Duration::from_secs(1), session.disconnect())
            .await
            .expect("disconnect hung behind a blocked write");
        assert!(matches!(result, Err(SessionError::Io(_))));
        assert!(session.is_closed());

        let write_result = timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked write was not released")
            .unwrap();
        assert!(matches!(write_result, Err(SessionError::Closed)));

        // Whatever fit in the buffer, then end of stream
        let mut received = Vec::new();
        timeout(Duration::from_secs(1), remote.read_to_end(&mut received))
            .await
            .expect("stream not closed")
            .unwrap();
        assert_eq!(received, vec![b'x'; 8]);
    }

    #[tokio::test]
    async fn test_close_resolves_closed() {
        let (session, _remote, _resize_tx) = test_session();
        session.close().await;

        timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("closed() did not resolve");
    }

    #[tokio::test]
    async fn test_next_resize() {
        let (session, _remote, resize_tx) = test_session();
        resize_tx.send(ScreenSize::new(80, 24)).await.unwrap();
        resize_tx.send(ScreenSize::new(100, 30)).await.unwrap();
        drop(resize_tx);

        assert_eq!(session.next_resize().await, Some(ScreenSize::new(80, 24)));
        assert_eq!(session.next_resize().await, Some(ScreenSize::new(100, 30)));
        assert_eq!(session.next_resize().await, None);
    }
}
