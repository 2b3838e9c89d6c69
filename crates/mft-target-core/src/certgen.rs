//! Certificate generation interface.
//!
//! A one-shot utility outside the runtime protocol surface: given a name
//! prefix it produces a self-signed key/certificate pair at two fixed
//! paths. Only the contract lives here; the implementation is an external
//! collaborator.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// The two fixed output paths derived from a name prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl CertificatePaths {
    /// `<dir>/<prefix>_key.pem` and `<dir>/<prefix>_cert.pem`.
    pub fn for_prefix(dir: &Path, prefix: &str) -> Self {
        Self {
            key_path: dir.join(format!("{prefix}_key.pem")),
            cert_path: dir.join(format!("{prefix}_cert.pem")),
        }
    }
}

/// One-shot generator contract: write a self-signed pair for `common_name`
/// under the derived paths and report where they landed.
pub trait CertificateGenerator {
    fn generate(&self, prefix: &str, common_name: &str) -> Result<CertificatePaths>;
}
