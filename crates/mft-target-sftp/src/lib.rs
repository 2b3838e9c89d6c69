//! # MFT Target SFTP
//!
//! SFTP surface of the file-transfer test target: the SFTP v3 wire protocol
//! (draft-ietf-secsh-filexfer-02) served over SSH (RFC 4251-4254) via
//! `russh`, with every filesystem verb routed through the sandboxed adapter
//! in `mft-target-core`.

pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::{Result, SftpError};
pub use server::SftpServer;
pub use session::SftpSession;
