//! SFTP-surface errors: the shared domain taxonomy plus SSH transport
//! failures from the russh layer.

use thiserror::Error;

/// Result alias for the SFTP crate.
pub type Result<T> = std::result::Result<T, SftpError>;

/// Errors raised on the SFTP surface.
#[derive(Error, Debug)]
pub enum SftpError {
    /// Domain error from the adapter layer.
    #[error(transparent)]
    Core(#[from] mft_target_core::Error),

    /// SSH transport failure.
    #[error("ssh error: {0}")]
    Ssh(String),
}

impl From<russh::Error> for SftpError {
    fn from(err: russh::Error) -> Self {
        SftpError::Ssh(err.to_string())
    }
}

impl From<russh_keys::Error> for SftpError {
    fn from(err: russh_keys::Error) -> Self {
        SftpError::Ssh(err.to_string())
    }
}
