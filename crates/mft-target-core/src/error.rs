//! Error types shared by every protocol surface.
//!
//! The variants here are the domain taxonomy; each protocol crate owns the
//! final mapping onto its wire status set (SFTP status codes, FTP reply
//! codes, HTTP status codes). OS-level failures are classified through
//! [`Error::from_io`] so that no I/O error can ever surface as success.

use thiserror::Error;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Domain errors for the file-transfer target.
#[derive(Error, Debug)]
pub enum Error {
    /// A virtual path resolved outside the sandbox root.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// File or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operating system refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory removal attempted on a non-empty directory.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Malformed or otherwise unusable path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Unknown or already-closed file handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Operation rejected by policy, not by accident.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Credential check failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation exceeded its time limit.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Uncategorized I/O failure; maps to the generic protocol failure code.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify an OS error against the path (or handle) it was raised for.
    ///
    /// Kinds without a dedicated variant stay wrapped as [`Error::Io`] and
    /// map to the generic failure status downstream.
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(what.to_string()),
            ErrorKind::PermissionDenied => Error::PermissionDenied(what.to_string()),
            ErrorKind::AlreadyExists => Error::AlreadyExists(what.to_string()),
            ErrorKind::DirectoryNotEmpty => Error::DirectoryNotEmpty(what.to_string()),
            ErrorKind::NotADirectory | ErrorKind::IsADirectory | ErrorKind::InvalidInput => {
                Error::InvalidPath(what.to_string())
            }
            _ => Error::Io(err),
        }
    }

    /// Errors worth an audit-level log line: sandbox escapes and bad logins.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::AccessDenied(_) | Error::Authentication(_) | Error::PermissionDenied(_)
        )
    }

    /// Message safe to hand to the remote peer.
    ///
    /// Denials and configuration failures are collapsed so path layout and
    /// credential details stay server-side.
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::AccessDenied(_) => "Access denied".to_string(),
            Error::Authentication(_) => "Authentication failed".to_string(),
            Error::PermissionDenied(_) => "Permission denied".to_string(),
            Error::Config(_) => "Server configuration error".to_string(),
            _ => self.to_string(),
        }
    }
}
