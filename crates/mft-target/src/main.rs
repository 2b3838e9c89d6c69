//! Multi-protocol file-transfer test target.
//!
//! Stands up FTP, SFTP, and HTTP listeners on loopback that accept uploads
//! with one static credential pair and persist everything into a shared
//! receive directory.
//!
//! Run with: cargo run --bin mft-target

use anyhow::{Context, Result};
use clap::Parser;
use mft_target_core::{LogFormat, SandboxFs, TargetConfig};
use mft_target_ftp::FtpServer;
use mft_target_http::HttpServer;
use mft_target_sftp::SftpServer;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for all listeners
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// FTP control port
    #[arg(long)]
    ftp_port: Option<u16>,

    /// SFTP port
    #[arg(long)]
    sftp_port: Option<u16>,

    /// HTTP upload port
    #[arg(long)]
    http_port: Option<u16>,

    /// Receive directory (created if missing)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Accepted username
    #[arg(short, long)]
    user: Option<String>,

    /// Accepted password
    #[arg(short, long)]
    password: Option<String>,

    /// SSH host key path
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path (stderr when unset)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<TargetConfig> {
        let mut config = match &self.config {
            Some(path) => TargetConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => TargetConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.ftp_port {
            config.ftp_port = port;
        }
        if let Some(port) = self.sftp_port {
            config.sftp_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(root) = self.root {
            config.receive_dir = root;
        }
        if let Some(user) = self.user {
            config.username = user;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = Some(host_key);
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(file) = self.log_file {
            config.logging.file = Some(file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }

        Ok(config)
    }
}

/// Initialize tracing from the logging section. The returned guard keeps a
/// file appender flushing for the process lifetime.
fn init_logging(config: &TargetConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if let Some(log_file) = &config.logging.file {
        let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let file_name = log_file
            .file_name()
            .context("log file path has no file name")?;

        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
        }
        Ok(Some(guard))
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;

    let _log_guard = init_logging(&config)?;

    config.validate().context("invalid configuration")?;

    // The shared receive directory exists before any listener starts.
    tokio::fs::create_dir_all(&config.receive_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create receive directory {}",
                config.receive_dir.display()
            )
        })?;

    let config = Arc::new(config);
    let fs = Arc::new(SandboxFs::new(config.sandbox()));
    let auth = Arc::new(config.credentials());

    info!(
        bind = %config.bind_address,
        ftp_port = config.ftp_port,
        sftp_port = config.sftp_port,
        http_port = config.http_port,
        receive_dir = %config.receive_dir.display(),
        username = %config.username,
        max_sessions = config.max_sessions,
        "starting file-transfer test target"
    );

    let ftp = FtpServer::new(config.clone(), fs.clone(), auth.clone());
    let ftp_handle = tokio::spawn(async move {
        if let Err(e) = ftp.run().await {
            error!(error = %e, "ftp server failed");
        }
    });

    let sftp = SftpServer::new(config.clone(), fs.clone(), auth.clone())
        .await
        .context("failed to initialize sftp server")?;
    let sftp_handle = tokio::spawn(async move {
        if let Err(e) = sftp.run().await {
            error!(error = %e, "sftp server failed");
        }
    });

    let http = HttpServer::new(config.clone(), fs.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http.run().await {
            error!(error = %e, "http server failed");
        }
    });

    info!("all listeners running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");

    ftp_handle.abort();
    sftp_handle.abort();
    http_handle.abort();

    Ok(())
}
