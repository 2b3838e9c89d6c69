//! Virtual filesystem adapter.
//!
//! [`VirtualFs`] is the verb set a remote peer can invoke, independent of
//! which protocol carried the request. [`SandboxFs`] is the one production
//! implementation: every path argument goes through the sandbox resolver
//! first, every OS failure is classified into the domain error taxonomy,
//! and symbolic links are rejected by policy.

use crate::error::{Error, Result};
use crate::handle::{FileHandle, OpenMode};
use crate::sandbox::SandboxRoot;
use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Open flags as requested by the peer, already decoded from the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRequest {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenRequest {
    /// Shorthand for a fresh upload: create, truncating existing content.
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Shorthand for appending, creating the file when absent.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            create: true,
            ..Self::default()
        }
    }

    /// Shorthand for a read-only open.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Select the open mode. Create-intent always wins over plain
    /// write-intent; append wins within either; everything else falls back
    /// to read-only. The exclusive flag is accepted off the wire but not
    /// honored.
    pub fn select_mode(&self) -> OpenMode {
        if self.create {
            if self.append {
                OpenMode::Append
            } else {
                OpenMode::CreateTruncate
            }
        } else if self.write {
            if self.append {
                OpenMode::Append
            } else {
                OpenMode::ReadWrite
            }
        } else {
            OpenMode::Read
        }
    }
}

/// OS-level metadata of one file or directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttributes {
    pub size: u64,
    /// Full st_mode bits (file type and permissions) on unix.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub is_dir: bool,
}

impl FileAttributes {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            size: meta.size(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.atime() as u32,
            mtime: meta.mtime() as u32,
            is_dir: meta.is_dir(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        Self {
            size: meta.len(),
            mode: if meta.is_dir() { 0o040_755 } else { 0o100_644 },
            uid: 0,
            gid: 0,
            atime: mtime,
            mtime,
            is_dir: meta.is_dir(),
        }
    }
}

/// Requested attribute changes for `chattr` (and creation attrs on the
/// wire, which are accepted and ignored).
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// One directory entry with its per-entry metadata.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attrs: FileAttributes,
}

/// The verb set exposed to remote peers.
#[async_trait]
pub trait VirtualFs: Send + Sync {
    async fn open(&self, path: &str, req: OpenRequest) -> Result<FileHandle>;
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;
    async fn stat(&self, path: &str) -> Result<FileAttributes>;
    async fn lstat(&self, path: &str) -> Result<FileAttributes>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn mkdir(&self, path: &str, attrs: AttrChanges) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn chattr(&self, path: &str, changes: AttrChanges) -> Result<()>;

    /// Symbolic links are not implemented by policy.
    async fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(Error::Unsupported("symlink".to_string()))
    }

    /// Symbolic links are not implemented by policy.
    async fn readlink(&self, _path: &str) -> Result<String> {
        Err(Error::Unsupported("readlink".to_string()))
    }
}

/// Sandboxed adapter over a real directory tree.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    sandbox: SandboxRoot,
}

impl SandboxFs {
    pub fn new(sandbox: SandboxRoot) -> Self {
        Self { sandbox }
    }

    /// The sandbox root backing this adapter.
    pub fn root(&self) -> &Path {
        self.sandbox.root()
    }

    fn resolve(&self, path: &str) -> Result<std::path::PathBuf> {
        self.sandbox.resolve(path).inspect_err(|e| {
            if e.is_security_event() {
                warn!(path, error = %e, "sandbox rejected path");
            }
        })
    }
}

#[async_trait]
impl VirtualFs for SandboxFs {
    async fn open(&self, path: &str, req: OpenRequest) -> Result<FileHandle> {
        let real = self.resolve(path)?;
        let mode = req.select_mode();

        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true);
            }
            OpenMode::CreateTruncate => {
                options.write(true).create(true).truncate(true);
                if req.read {
                    options.read(true);
                }
            }
            OpenMode::Append => {
                options.append(true);
                if req.read {
                    options.read(true);
                }
                if req.create {
                    options.create(true);
                }
            }
        }

        // Create-intent implies the parent directories exist afterwards.
        if req.create {
            if let Some(parent) = real.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::from_io(e, path))?;
            }
        }

        debug!(path, ?mode, "open");
        let file = options
            .open(&real)
            .await
            .map_err(|e| Error::from_io(e, path))?;

        Ok(FileHandle::new(real, mode, file))
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let real = self.resolve(path)?;

        let mut reader = fs::read_dir(&real)
            .await
            .map_err(|e| Error::from_io(e, path))?;

        // Any failure mid-enumeration aborts the whole listing; partial
        // results are never returned.
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::from_io(e, path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry
                .metadata()
                .await
                .map_err(|e| Error::from_io(e, &name))?;
            entries.push(DirEntry {
                name,
                attrs: FileAttributes::from_metadata(&meta),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileAttributes> {
        let real = self.resolve(path)?;
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        Ok(FileAttributes::from_metadata(&meta))
    }

    async fn lstat(&self, path: &str) -> Result<FileAttributes> {
        let real = self.resolve(path)?;
        let meta = fs::symlink_metadata(&real)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        Ok(FileAttributes::from_metadata(&meta))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let real = self.resolve(path)?;
        fs::remove_file(&real)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    async fn mkdir(&self, path: &str, _attrs: AttrChanges) -> Result<()> {
        let real = self.resolve(path)?;
        // Idempotent: an existing directory is success, and missing parents
        // are created along the way. Creation-mode attrs are ignored.
        fs::create_dir_all(&real)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let real = self.resolve(path)?;
        fs::remove_dir(&real)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let old = self.resolve(from)?;
        let new = self.resolve(to)?;
        fs::rename(&old, &new)
            .await
            .map_err(|e| Error::from_io(e, from))
    }

    async fn chattr(&self, path: &str, changes: AttrChanges) -> Result<()> {
        let real = self.resolve(path)?;

        #[cfg(unix)]
        if let Some(mode) = changes.mode {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode & 0o7777);
            fs::set_permissions(&real, perms)
                .await
                .map_err(|e| Error::from_io(e, path))?;
            debug!(path, mode = format_args!("{mode:o}"), "mode changed");
        }

        // Ownership changes only when both identifiers are present; a
        // lone uid or gid is a no-op for ownership while mode still applies.
        #[cfg(unix)]
        if let (Some(uid), Some(gid)) = (changes.uid, changes.gid) {
            use std::os::unix::ffi::OsStrExt;

            let path_c = std::ffi::CString::new(real.as_os_str().as_bytes())
                .map_err(|_| Error::InvalidPath("path contains NUL byte".to_string()))?;

            // SAFETY: path_c is a valid NUL-terminated string for the
            // duration of the call.
            let rc = unsafe { libc::chown(path_c.as_ptr(), uid, gid) };
            if rc != 0 {
                return Err(Error::from_io(std::io::Error::last_os_error(), path));
            }
            debug!(path, uid, gid, "ownership changed");
        }

        #[cfg(not(unix))]
        let _ = changes;

        Ok(())
    }
}
