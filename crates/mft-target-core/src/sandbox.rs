//! Path sandbox resolver.
//!
//! Maps client-supplied virtual paths onto real paths confined to one root
//! directory. Resolution is purely lexical: leading separators are stripped,
//! `.` and `..` segments are collapsed, and the result must still start with
//! the root. No filesystem calls are made.
//!
//! Known gap: because the check is lexical rather than symlink-resolved, a
//! symbolic link planted *inside* the root can point outside it and the
//! resolver will not notice. Symlink creation is rejected by the adapter
//! layer, but links created out-of-band are not caught here.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// The single directory all client-visible operations must resolve under.
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    root: PathBuf,
}

impl SandboxRoot {
    /// Wrap a root directory. The path is normalized lexically so that the
    /// later prefix check compares like with like.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(&root.into()),
        }
    }

    /// The real root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to a real path under the root.
    ///
    /// Fails with [`Error::AccessDenied`] when the normalized result leaves
    /// the root, and [`Error::InvalidPath`] for NUL bytes. The empty path
    /// and `/` both resolve to the root itself.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        if virtual_path.contains('\0') {
            return Err(Error::InvalidPath(
                "path contains NUL byte".to_string(),
            ));
        }

        let relative = virtual_path.trim_start_matches('/');
        let resolved = normalize(&self.root.join(relative));

        if !resolved.starts_with(&self.root) {
            return Err(Error::AccessDenied(virtual_path.to_string()));
        }

        Ok(resolved)
    }
}

/// Collapse `.` and `..` segments without touching the filesystem.
///
/// A `..` at the filesystem root is dropped, matching OS semantics, so
/// `/../../etc` normalizes to `/etc` and then fails the prefix check.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
        }
    }

    out
}

/// Normalize a virtual path into canonical absolute form (`/a/b`).
///
/// Used for REALPATH responses and for tracking an FTP session's working
/// directory. `..` never climbs above `/`.
pub fn normalize_virtual(virtual_path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in virtual_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}
