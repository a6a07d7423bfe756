//! SSH server listener
//!
//! Accepts incoming connections and gives each one a client handler, a
//! channel acceptor and a connection supervisor.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sx_core::config::ServerConfig;
use sx_core::ConnectionError;

use crate::connection::{receiver_stream, ChannelAcceptor, ConnectionSupervisor};
use crate::server::handler::{ClientHandler, SshConfig};
use crate::session::{SessionHandler, SessionRegistry};

/// Queue depth between a connection's handler and its supervisor
const EVENT_QUEUE_SIZE: usize = 16;

/// How long an open connection may keep running after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// russh configuration
    ssh_config: SshConfig,
    /// Server settings
    config: ServerConfig,
    /// Application handler run for every session
    handler: Arc<dyn SessionHandler>,
    /// Open sessions across all connections
    registry: Arc<SessionRegistry>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
    /// Connection slots, if capped
    connection_slots: Option<Arc<Semaphore>>,
    /// Running connection tasks
    connections: TaskTracker,
}

impl SshServer {
    /// Create a new SSH server
    pub fn new(
        host_key: KeyPair,
        config: ServerConfig,
        handler: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let connection_slots = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit as usize)));

        Self {
            ssh_config: SshConfig::new(host_key, &config),
            config,
            handler,
            registry: Arc::new(SessionRegistry::new()),
            cancel,
            connection_slots,
            connections: TaskTracker::new(),
        }
    }

    /// Sessions currently open
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until cancelled
    pub async fn run(&self) -> Result<()> {
        let bind_addr = &self.config.bind_address;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        loop {
            tokio::select! {
                // Check for shutdown
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        let open = self.registry.len();
        if open > 0 {
            tracing::info!("Disconnecting {} open session(s)", open);
        }
        self.registry.disconnect_all().await;

        self.connections.close();
        if tokio::time::timeout(SHUTDOWN_GRACE * 2, self.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!("{} connection(s) still open at shutdown", self.connections.len());
        }

        Ok(())
    }

    /// Handle a new incoming connection
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = match &self.connection_slots {
            Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let limit = self.config.max_connections.unwrap_or_default();
                    tracing::warn!(
                        "Refusing connection from {}: {}",
                        peer_addr,
                        ConnectionError::LimitExceeded { limit }
                    );
                    return;
                }
            },
            None => None,
        };

        tracing::info!("New connection from {}", peer_addr);

        let (channel_tx, channel_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (global_tx, global_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let client = ClientHandler::new(peer_addr, channel_tx, global_tx);

        let acceptor = ChannelAcceptor::new(
            Arc::clone(&self.handler),
            self.config.session.clone(),
            Arc::clone(&self.registry),
        )
        .with_channel_limit(self.config.max_channels_per_connection);
        let supervisor = ConnectionSupervisor::new(acceptor, peer_addr.to_string());
        tokio::spawn(supervisor.run(receiver_stream(channel_rx), receiver_stream(global_rx)));

        let config = Arc::clone(&self.ssh_config.ssh_config);
        let cancel = self.cancel.clone();

        // Spawn a task to handle this connection
        self.connections.spawn(async move {
            let _permit = permit;

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                    return;
                }
                result = russh::server::run_stream(config, socket, client) => result
            };

            let running = match result {
                Ok(running) => running,
                Err(e) => {
                    tracing::warn!(
                        "Connection from {} failed: {}",
                        peer_addr,
                        ConnectionError::Handshake(e.to_string())
                    );
                    return;
                }
            };

            tokio::pin!(running);
            let result = tokio::select! {
                result = &mut running => result,
                _ = cancel.cancelled() => {
                    // Sessions are being disconnected; let their farewells drain
                    match tokio::time::timeout(SHUTDOWN_GRACE, &mut running).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::debug!("Dropping connection from {} at shutdown", peer_addr);
                            return;
                        }
                    }
                }
            };

            match result {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Resolve the host key from configuration
///
/// An inline key wins over the key file. A missing key file is generated.
pub async fn load_host_key(config: &ServerConfig) -> Result<KeyPair> {
    match &config.host_key {
        Some(pem) => {
            tracing::info!("Using inline host key");
            russh_keys::decode_secret_key(pem, None).context("Failed to decode inline host key")
        }
        None => load_or_generate_host_key(&config.host_key_path).await,
    }
}

/// Load or generate a host key
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn fingerprint(key: &KeyPair) -> String {
        key.clone_public_key().unwrap().fingerprint()
    }

    #[tokio::test]
    async fn test_generated_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_key");

        let generated = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());

        let loaded = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(fingerprint(&generated), fingerprint(&loaded));
    }

    #[tokio::test]
    async fn test_inline_key_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        let generated = load_or_generate_host_key(&path).await.unwrap();

        let config = ServerConfig {
            host_key: Some(std::fs::read_to_string(&path).unwrap()),
            host_key_path: dir.path().join("unused"),
            ..ServerConfig::default()
        };
        let loaded = load_host_key(&config).await.unwrap();
        assert_eq!(fingerprint(&generated), fingerprint(&loaded));
        assert!(!dir.path().join("unused").exists());
    }

    #[tokio::test]
    async fn test_bad_inline_key() {
        let config = ServerConfig {
            host_key: Some("not a key".to_string()),
            ..ServerConfig::default()
        };
        assert!(load_host_key(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let key = KeyPair::generate_ed25519().unwrap();
        let handler = |_session: Session| async move {};
        let cancel = CancellationToken::new();
        let server = SshServer::new(
            key,
            ServerConfig::default(),
            Arc::new(handler),
            cancel.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        cancel.cancel();
        server.serve(listener).await.unwrap();
        assert!(server.registry().is_empty());
    }
}
