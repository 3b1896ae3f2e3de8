//! SSH Connection Manager
//!
//! Provides one persistent SSH transport per target with lazy connection,
//! automatic reconnection and serialized connection establishment. Exec and
//! SFTP channels are multiplexed over the shared transport.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::Channel;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::config::SshConfig;
use super::handler::ClientHandler;
use crate::config::CONNECTION_TIMEOUT_SECS;
use crate::error::{GatewayError, Result};

/// Lifecycle of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    /// The transport dropped; the next operation reconnects
    Disconnected,
    Closed,
}

/// SSH Connection Manager
///
/// - Connects on first use and reconnects when the transport drops
/// - One connection attempt at a time; waiters reuse its result
/// - 30-second connection timeout
pub struct SshConnectionManager {
    /// SSH configuration
    config: SshConfig,

    /// Parsed private key
    key: Arc<PrivateKey>,

    /// Active SSH session handle
    session: Mutex<Option<Arc<Handle<ClientHandler>>>>,

    /// Held while a transport is being established
    connect_lock: Mutex<()>,

    state: Mutex<ConnectionState>,
}

impl SshConnectionManager {
    /// Create a new SSH Connection Manager
    ///
    /// Parses the private key but does not connect; call
    /// `ensure_connected()` to establish the connection.
    pub fn new(config: SshConfig) -> Result<Self> {
        let key = PrivateKey::from_openssh(config.private_key.as_bytes()).map_err(|e| {
            GatewayError::config(format!(
                "Failed to parse private key for '{}': {}",
                config.host, e
            ))
        })?;

        Ok(Self {
            config,
            key: Arc::new(key),
            session: Mutex::new(None),
            connect_lock: Mutex::new(()),
            state: Mutex::new(ConnectionState::Uninitialized),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.lock().await = state;
    }

    /// Current handle if the transport is still open
    async fn live_handle(&self) -> Option<Arc<Handle<ClientHandler>>> {
        {
            let mut session_guard = self.session.lock().await;
            match session_guard.as_ref() {
                Some(handle) if !handle.is_closed() => return Some(handle.clone()),
                Some(_) => *session_guard = None,
                None => return None,
            }
        }

        info!("SSH transport to {} closed", self.config.host);
        self.set_state(ConnectionState::Disconnected).await;
        None
    }

    /// Ensure connection is established, reconnecting if necessary
    ///
    /// Concurrent callers queue on the connect lock; whoever gets it after a
    /// successful attempt finds the live handle and returns it.
    pub async fn ensure_connected(&self) -> Result<Arc<Handle<ClientHandler>>> {
        if let Some(handle) = self.live_handle().await {
            return Ok(handle);
        }

        let _connecting = self.connect_lock.lock().await;
        if let Some(handle) = self.live_handle().await {
            debug!("Connection established by another task");
            return Ok(handle);
        }

        self.set_state(ConnectionState::Connecting).await;
        match self.do_connect().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                *self.session.lock().await = Some(handle.clone());
                self.set_state(ConnectionState::Ready).await;
                Ok(handle)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Internal connection logic
    async fn do_connect(&self) -> Result<Handle<ClientHandler>> {
        info!(
            "Connecting to SSH server {}:{}...",
            self.config.host, self.config.port
        );

        let connection_timeout = Duration::from_secs(CONNECTION_TIMEOUT_SECS);
        let ssh_config = Arc::new(client::Config::default());

        let addr = self.config.address();
        let connect_result = timeout(
            connection_timeout,
            client::connect(ssh_config, addr.as_str(), ClientHandler::new(&self.config.host)),
        )
        .await;

        let mut session = match connect_result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!("SSH connection to {} failed: {}", addr, e);
                return Err(GatewayError::connection(e.to_string()));
            }
            Err(_) => {
                error!("SSH connection timeout after {}s", CONNECTION_TIMEOUT_SECS);
                return Err(GatewayError::connection(format!(
                    "Connection timeout after {}s",
                    CONNECTION_TIMEOUT_SECS
                )));
            }
        };

        self.authenticate(&mut session).await?;

        info!(
            "Successfully connected to {}@{}:{}",
            self.config.username, self.config.host, self.config.port
        );

        Ok(session)
    }

    /// Authenticate with the private key
    async fn authenticate(&self, session: &mut Handle<ClientHandler>) -> Result<()> {
        debug!(
            "Attempting key authentication for user '{}'",
            self.config.username
        );

        // RSA keys need the strongest hash the server accepts; None otherwise
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| GatewayError::auth(e.to_string()))?
            .flatten();
        let key_with_alg = PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);

        let auth_result = session
            .authenticate_publickey(&self.config.username, key_with_alg)
            .await
            .map_err(|e| GatewayError::auth(e.to_string()))?;

        if auth_result.success() {
            info!("Key authentication successful");
            Ok(())
        } else {
            Err(GatewayError::auth("Key authentication rejected"))
        }
    }

    /// Open a new session channel, connecting first if needed
    pub async fn open_channel(&self) -> Result<Channel<client::Msg>> {
        let session = self.ensure_connected().await?;

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::connection(format!("Failed to open channel: {}", e)))?;

        Ok(channel)
    }

    /// Close the SSH connection
    pub async fn close(&self) {
        let _connecting = self.connect_lock.lock().await;
        if let Some(session) = self.session.lock().await.take() {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            info!("SSH connection to {} closed", self.config.host);
        }
        self.set_state(ConnectionState::Closed).await;
    }
}

impl std::fmt::Debug for SshConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnectionManager")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("username", &self.config.username)
            .finish()
    }
}
