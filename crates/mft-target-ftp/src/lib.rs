//! # MFT Target FTP
//!
//! Minimal FTP surface (RFC 959 subset) of the file-transfer test target:
//! single static login, passive-mode transfers, uploads and downloads
//! against the shared sandboxed receive directory.

pub mod server;
pub mod session;

pub use server::FtpServer;
pub use session::FtpSession;
