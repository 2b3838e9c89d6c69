//! SFTP server: listener loop and per-connection SSH session handling.
//!
//! The listener owns its accept loop and a bounded worker pool; russh
//! drives key exchange and the SSH state machine for each connection. A
//! session moves accepted → key-exchanged → authenticated → channel-open →
//! closed, and while the channel is open the owning worker sits in an
//! idle-poll loop until the transport goes quiet.

use crate::error::{Result, SftpError};
use crate::session::SftpSession;
use async_trait::async_trait;
use mft_target_core::{Authenticator, Error, SandboxFs, StaticCredentials, TargetConfig};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one SSH connection, for logging and request gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Accepted,
    Authenticated,
    ChannelOpen,
}

/// The SFTP listener.
pub struct SftpServer {
    config: Arc<TargetConfig>,
    fs: Arc<SandboxFs>,
    auth: Arc<StaticCredentials>,
    ssh_config: Arc<russh::server::Config>,
}

impl SftpServer {
    /// Build the server, loading (or generating) the SSH host key.
    pub async fn new(
        config: Arc<TargetConfig>,
        fs: Arc<SandboxFs>,
        auth: Arc<StaticCredentials>,
    ) -> Result<Self> {
        let host_key = load_host_key(config.host_key_path.as_deref()).await?;

        let ssh_config = russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(config.session_timeout_secs)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };

        Ok(Self {
            config,
            fs,
            auth,
            ssh_config: Arc::new(ssh_config),
        })
    }

    /// Accept connections until the process exits. Accept-time errors are
    /// logged and never terminate the listener.
    pub async fn run(&self) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.sftp_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SftpError::Core(Error::Connection(format!("bind {addr}: {e}"))))?;
        info!(%addr, root = %self.fs.root().display(), "sftp server listening");

        let workers = Arc::new(Semaphore::new(self.config.max_sessions));

        loop {
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(SftpError::Core(Error::Connection(
                        "worker pool closed".to_string(),
                    )));
                }
            };

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let ssh_config = self.ssh_config.clone();
                    let config = self.config.clone();
                    let fs = self.fs.clone();
                    let auth = self.auth.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_connection(ssh_config, stream, peer, config, fs, auth).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Drive one connection from handshake to teardown. Never propagates an
/// error back to the accept loop.
async fn handle_connection(
    ssh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<TargetConfig>,
    fs: Arc<SandboxFs>,
    auth: Arc<StaticCredentials>,
) {
    let handler = SessionHandler {
        peer,
        auth,
        state: SessionState::Accepted,
        sftp: SftpSession::new(fs),
    };

    let session = match russh::server::run_stream(ssh_config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, error = %e, "ssh handshake failed");
            return;
        }
    };
    tokio::pin!(session);

    // Idle-poll loop: wake on a bounded tick while the transport is live;
    // the session future completes when the peer disconnects or the
    // inactivity timeout fires.
    let mut poll = tokio::time::interval(Duration::from_secs(config.idle_poll_interval_secs));
    loop {
        tokio::select! {
            result = &mut session => {
                match result {
                    Ok(()) => info!(%peer, "session closed"),
                    Err(e) => warn!(%peer, error = %e, "session ended with error"),
                }
                break;
            }
            _ = poll.tick() => {
                trace!(%peer, "session liveness poll");
            }
        }
    }
}

/// russh handler for one connection.
struct SessionHandler {
    peer: SocketAddr,
    auth: Arc<StaticCredentials>,
    state: SessionState,
    sftp: SftpSession,
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = SftpError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        if self.auth.check_password(user, password) {
            info!(peer = %self.peer, user, "password authentication succeeded");
            self.state = SessionState::Authenticated;
            Ok(Auth::Accept)
        } else {
            // No lockout, no rate limiting: the peer may retry.
            Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PASSWORD),
            })
        }
    }

    async fn auth_publickey(&mut self, user: &str, _key: &key::PublicKey) -> Result<Auth> {
        debug!(peer = %self.peer, user, "publickey authentication not offered");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(peer = %self.peer, "session channel opened");
        self.state = SessionState::ChannelOpen;
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
    ) -> Result<bool> {
        // Only interactive session channels are allowed.
        warn!(
            peer = %self.peer,
            host_to_connect,
            port_to_connect,
            "direct-tcpip channel administratively rejected"
        );
        Ok(false)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name == "sftp" && self.state == SessionState::ChannelOpen {
            debug!(peer = %self.peer, "sftp subsystem started");
            session.channel_success(channel_id);
        } else {
            warn!(peer = %self.peer, subsystem = name, "subsystem rejected");
            session.channel_failure(channel_id);
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let response = self.sftp.handle_data(data).await.map_err(|e| {
            warn!(peer = %self.peer, error = %e, "sftp packet handling failed");
            SftpError::Core(e)
        })?;

        if !response.is_empty() {
            session.data(channel, CryptoVec::from_slice(&response));
        }

        Ok(())
    }
}

/// Load the configured host key, or generate a throwaway ed25519 key.
async fn load_host_key(path: Option<&Path>) -> Result<key::KeyPair> {
    let Some(path) = path else {
        return generate_host_key();
    };

    if !path.exists() {
        warn!(path = %path.display(), "host key not found, generating ephemeral key");
        return generate_host_key();
    }

    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SftpError::Core(Error::from_io(e, &path.display().to_string())))?;

    russh_keys::decode_secret_key(&data, None)
        .map_err(|e| SftpError::Core(Error::Config(format!("failed to load host key: {e}"))))
}

fn generate_host_key() -> Result<key::KeyPair> {
    key::KeyPair::generate_ed25519().ok_or_else(|| {
        SftpError::Core(Error::Config("failed to generate host key".to_string()))
    })
}
