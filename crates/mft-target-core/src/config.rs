//! Target configuration.
//!
//! One explicit struct, constructed at startup and passed by `Arc` into
//! every listener; there are no process-wide mutable settings.

use crate::auth::StaticCredentials;
use crate::sandbox::SandboxRoot;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Configuration shared by all three protocol listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Address every listener binds to. Loopback by default; this is a test
    /// fixture, not a public server.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// FTP control port.
    #[serde(default = "default_ftp_port")]
    pub ftp_port: u16,

    /// SFTP (SSH) port.
    #[serde(default = "default_sftp_port")]
    pub sftp_port: u16,

    /// HTTP upload port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Directory all received files land in; created at startup if absent.
    #[serde(default = "default_receive_dir")]
    pub receive_dir: PathBuf,

    /// The single accepted username.
    #[serde(default = "default_username")]
    pub username: String,

    /// The single accepted password.
    #[serde(default = "default_password")]
    pub password: String,

    /// FTP greeting banner.
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Maximum concurrent sessions per protocol listener.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Per-session inactivity timeout in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Tick of the idle-poll loop an open SFTP session sits in.
    #[serde(default = "default_idle_poll_interval")]
    pub idle_poll_interval_secs: u64,

    /// SSH host key path. A fresh ed25519 key is generated when unset or
    /// missing, which is fine for a throwaway test target.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional log file; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text.
    Text,
    /// Structured JSON lines.
    Json,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ftp_port: default_ftp_port(),
            sftp_port: default_sftp_port(),
            http_port: default_http_port(),
            receive_dir: default_receive_dir(),
            username: default_username(),
            password: default_password(),
            banner: default_banner(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            idle_poll_interval_secs: default_idle_poll_interval(),
            host_key_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl TargetConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Validate bounds before any listener starts.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_sessions == 0 {
            return Err(crate::Error::Config(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.idle_poll_interval_secs == 0 {
            return Err(crate::Error::Config(
                "idle_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(crate::Error::Config(
                "username and password must be non-empty".to_string(),
            ));
        }

        let ports = [self.ftp_port, self.sftp_port, self.http_port];
        for port in ports {
            if port == 0 {
                return Err(crate::Error::Config("listener ports must be non-zero".to_string()));
            }
        }

        Ok(())
    }

    /// The sandbox root over the receive directory.
    pub fn sandbox(&self) -> SandboxRoot {
        SandboxRoot::new(&self.receive_dir)
    }

    /// The static credential pair every protocol accepts.
    pub fn credentials(&self) -> StaticCredentials {
        StaticCredentials::new(&self.username, &self.password)
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_ftp_port() -> u16 {
    2121
}

fn default_sftp_port() -> u16 {
    2222
}

fn default_http_port() -> u16 {
    8080
}

fn default_receive_dir() -> PathBuf {
    PathBuf::from("ftpreceive")
}

fn default_username() -> String {
    "ftp".to_string()
}

fn default_password() -> String {
    "ftp".to_string()
}

fn default_banner() -> String {
    "MFT test target ready".to_string()
}

fn default_max_sessions() -> usize {
    50
}

fn default_session_timeout() -> u64 {
    300
}

fn default_idle_poll_interval() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TargetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ftp_port, 2121);
        assert_eq!(config.sftp_port, 2222);
        assert!(config.bind_address.is_loopback());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TargetConfig = toml::from_str(
            r#"
            ftp_port = 9121
            receive_dir = "/tmp/drop"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.ftp_port, 9121);
        assert_eq!(config.sftp_port, 2222);
        assert_eq!(config.receive_dir, PathBuf::from("/tmp/drop"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.username, "ftp");
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let mut config = TargetConfig::default();
        config.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = TargetConfig::default();
        config.http_port = 0;
        assert!(config.validate().is_err());

        let mut config = TargetConfig::default();
        config.password.clear();
        assert!(config.validate().is_err());
    }
}
