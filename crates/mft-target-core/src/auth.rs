//! Authentication seam.
//!
//! The target accepts exactly one static username/password pair, identical
//! across all three protocols. The trait exists so tests can substitute
//! their own policy; there is no lockout and no rate limiting.

use tracing::warn;

/// Password check used by every protocol frontend.
pub trait Authenticator: Send + Sync {
    /// `true` only for the configured credential pair.
    fn check_password(&self, username: &str, password: &str) -> bool;
}

/// The single configured credential pair.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The accepted username, for greeting/log lines.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Authenticator for StaticCredentials {
    fn check_password(&self, username: &str, password: &str) -> bool {
        let ok = username == self.username && password == self.password;
        if !ok {
            warn!(username, "authentication rejected");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_exact_pair_passes() {
        let auth = StaticCredentials::new("ftp", "ftp");

        assert!(auth.check_password("ftp", "ftp"));
        assert!(!auth.check_password("ftp", "wrong"));
        assert!(!auth.check_password("wrong", "ftp"));
        assert!(!auth.check_password("", ""));
        assert!(!auth.check_password("FTP", "ftp"));
    }
}
