//! FTP listener loop.

use crate::session::FtpSession;
use mft_target_core::{Error, Result, SandboxFs, StaticCredentials, TargetConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// The FTP listener.
pub struct FtpServer {
    config: Arc<TargetConfig>,
    fs: Arc<SandboxFs>,
    auth: Arc<StaticCredentials>,
}

impl FtpServer {
    pub fn new(
        config: Arc<TargetConfig>,
        fs: Arc<SandboxFs>,
        auth: Arc<StaticCredentials>,
    ) -> Self {
        Self { config, fs, auth }
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.ftp_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("bind {addr}: {e}")))?;
        info!(%addr, root = %self.fs.root().display(), "ftp server listening");

        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener. Accept-time errors
    /// are logged and never terminate the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let workers = Arc::new(Semaphore::new(self.config.max_sessions));

        loop {
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(Error::Connection("worker pool closed".to_string()));
                }
            };

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let session = FtpSession::new(
                        stream,
                        peer,
                        self.config.clone(),
                        self.fs.clone(),
                        self.auth.clone(),
                    );

                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = session.run().await {
                            warn!(%peer, error = %e, "ftp session ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}
