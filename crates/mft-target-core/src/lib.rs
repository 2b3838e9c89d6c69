//! # MFT Target Core
//!
//! Shared domain layer of the file-transfer test target: the sandboxed
//! virtual filesystem every protocol frontend drives, the per-file handle
//! discipline, the error taxonomy, and the startup configuration.
//!
//! Protocol crates (`mft-target-ftp`, `mft-target-sftp`, `mft-target-http`)
//! translate their wire formats onto [`VirtualFs`] and map [`Error`] onto
//! their own status sets.

pub mod auth;
pub mod certgen;
pub mod config;
pub mod error;
pub mod handle;
pub mod sandbox;
pub mod vfs;

pub use auth::{Authenticator, StaticCredentials};
pub use config::{LogFormat, LoggingConfig, TargetConfig};
pub use error::{Error, Result};
pub use handle::{FileHandle, OpenMode};
pub use sandbox::{SandboxRoot, normalize_virtual};
pub use vfs::{AttrChanges, DirEntry, FileAttributes, OpenRequest, SandboxFs, VirtualFs};
