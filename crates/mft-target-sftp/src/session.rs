//! Per-session SFTP request dispatch.
//!
//! One [`SftpSession`] per SSH connection. It owns the session's handle
//! table and routes every request through the sandboxed adapter; filesystem
//! failures become STATUS responses, only wire-protocol violations abort
//! the session.

use crate::protocol::{
    PacketBuffer, PacketType, StatusCode, VERSION, WireAttrs, codec, decode_pflags,
};
use bytes::{BufMut, BytesMut};
use mft_target_core::{
    DirEntry, Error, FileHandle, Result, SandboxFs, VirtualFs, normalize_virtual,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cap on simultaneously open handles per session.
const MAX_HANDLES: usize = 1024;

/// Directory entries returned per READDIR round.
const READDIR_CHUNK: usize = 100;

/// Longest read served in one DATA response; the peer re-requests the rest.
const MAX_READ_LEN: u32 = 128 * 1024;

enum SessionHandle {
    File {
        vpath: String,
        file: Arc<FileHandle>,
    },
    Dir {
        vpath: String,
        entries: Vec<DirEntry>,
        cursor: usize,
    },
}

/// State for one SFTP session.
pub struct SftpSession {
    fs: Arc<SandboxFs>,
    inbox: PacketBuffer,
    handles: HashMap<u32, SessionHandle>,
    next_handle: u32,
    initialized: bool,
}

impl SftpSession {
    pub fn new(fs: Arc<SandboxFs>) -> Self {
        Self {
            fs,
            inbox: PacketBuffer::default(),
            handles: HashMap::new(),
            next_handle: 0,
            initialized: false,
        }
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Feed raw channel data; returns the concatenated framed responses for
    /// every complete packet it contained.
    pub async fn handle_data(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.inbox.push(data);

        let mut out = Vec::new();
        while let Some(packet) = self.inbox.try_next()? {
            out.extend_from_slice(&self.dispatch(&packet).await?);
        }
        Ok(out)
    }

    async fn dispatch(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let mut buf = &packet[..];
        let type_byte = match buf.first() {
            Some(b) => *b,
            None => return Err(Error::Protocol("empty packet".to_string())),
        };
        buf = &buf[1..];

        let Some(kind) = PacketType::from_u8(type_byte) else {
            // Unknown request: answer unsupported when the request id is
            // still recoverable, otherwise give up on the session.
            let request_id = codec::take_u32(&mut buf)?;
            warn!(type_byte, "unknown request type");
            return Ok(status(request_id, StatusCode::OpUnsupported, "unsupported request"));
        };

        debug!(?kind, "request");

        if !self.initialized && kind != PacketType::Init {
            return Err(Error::Protocol(format!(
                "{kind:?} request before initialization"
            )));
        }

        match kind {
            PacketType::Init => self.handle_init(&mut buf),
            PacketType::Open => self.handle_open(&mut buf).await,
            PacketType::Close => self.handle_close(&mut buf).await,
            PacketType::Read => self.handle_read(&mut buf).await,
            PacketType::Write => self.handle_write(&mut buf).await,
            PacketType::Stat => self.handle_stat(&mut buf, true).await,
            PacketType::Lstat => self.handle_stat(&mut buf, false).await,
            PacketType::Fstat => self.handle_fstat(&mut buf).await,
            PacketType::Setstat => self.handle_setstat(&mut buf).await,
            PacketType::Fsetstat => self.handle_fsetstat(&mut buf).await,
            PacketType::Opendir => self.handle_opendir(&mut buf).await,
            PacketType::Readdir => self.handle_readdir(&mut buf),
            PacketType::Remove => self.handle_remove(&mut buf).await,
            PacketType::Mkdir => self.handle_mkdir(&mut buf).await,
            PacketType::Rmdir => self.handle_rmdir(&mut buf).await,
            PacketType::Realpath => self.handle_realpath(&mut buf),
            PacketType::Rename => self.handle_rename(&mut buf).await,
            PacketType::Readlink => self.handle_readlink(&mut buf),
            PacketType::Symlink => self.handle_symlink(&mut buf),
            other => {
                let request_id = codec::take_u32(&mut buf)?;
                warn!(?other, "unsupported request type");
                Ok(status(
                    request_id,
                    StatusCode::OpUnsupported,
                    "unsupported request",
                ))
            }
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let client_version = codec::take_u32(buf)?;
        info!(client_version, "sftp session initialized");
        self.initialized = true;

        let mut body = BytesMut::new();
        body.put_u8(PacketType::Version.as_u8());
        body.put_u32(VERSION);
        Ok(frame(&body))
    }

    async fn handle_open(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;
        let bits = codec::take_u32(buf)?;
        let _attrs = WireAttrs::decode(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            warn!(path, "handle table full");
            return Ok(status(
                request_id,
                StatusCode::Failure,
                "too many open handles",
            ));
        }

        match self.fs.open(&path, decode_pflags(bits)).await {
            Ok(file) => {
                let id = self.insert_handle(SessionHandle::File {
                    vpath: path,
                    file: Arc::new(file),
                });
                Ok(handle_response(request_id, id))
            }
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_close(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let id = take_handle_id(buf)?;

        match self.handles.remove(&id) {
            Some(SessionHandle::File { vpath, file }) => {
                debug!(path = %vpath, "close");
                match file.close().await {
                    Ok(()) => Ok(status(request_id, StatusCode::Ok, "Success")),
                    Err(e) => Ok(status_error(request_id, &e)),
                }
            }
            Some(SessionHandle::Dir { vpath, .. }) => {
                debug!(path = %vpath, "closedir");
                Ok(status(request_id, StatusCode::Ok, "Success"))
            }
            None => Ok(status_error(
                request_id,
                &Error::InvalidHandle("no such handle".to_string()),
            )),
        }
    }

    async fn handle_read(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let id = take_handle_id(buf)?;
        let offset = codec::take_u64(buf)?;
        let len = codec::take_u32(buf)?.min(MAX_READ_LEN);

        let file = match self.file_handle(id) {
            Ok(file) => file,
            Err(e) => return Ok(status_error(request_id, &e)),
        };

        match file.read_at(offset, len).await {
            Ok(data) if data.is_empty() && len > 0 => {
                Ok(status(request_id, StatusCode::Eof, "End of file"))
            }
            Ok(data) => Ok(data_response(request_id, &data)),
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_write(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let id = take_handle_id(buf)?;
        let offset = codec::take_u64(buf)?;
        let data = codec::take_bytes(buf)?;

        let file = match self.file_handle(id) {
            Ok(file) => file,
            Err(e) => return Ok(status_error(request_id, &e)),
        };

        match file.write_at(offset, &data).await {
            Ok(()) => Ok(status(request_id, StatusCode::Ok, "Success")),
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_stat(&mut self, buf: &mut &[u8], follow: bool) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;

        let result = if follow {
            self.fs.stat(&path).await
        } else {
            self.fs.lstat(&path).await
        };

        match result {
            Ok(attrs) => Ok(attrs_response(request_id, attrs.into())),
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_fstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let id = take_handle_id(buf)?;

        let file = match self.file_handle(id) {
            Ok(file) => file,
            Err(e) => return Ok(status_error(request_id, &e)),
        };

        match file.stat().await {
            Ok(attrs) => Ok(attrs_response(request_id, attrs.into())),
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_setstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;
        let attrs = WireAttrs::decode(buf)?;

        match self.fs.chattr(&path, attrs.changes()).await {
            Ok(()) => Ok(status(request_id, StatusCode::Ok, "Success")),
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_fsetstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let id = take_handle_id(buf)?;
        let attrs = WireAttrs::decode(buf)?;

        let vpath = match self.handles.get(&id) {
            Some(SessionHandle::File { vpath, .. }) => vpath.clone(),
            Some(SessionHandle::Dir { vpath, .. }) => vpath.clone(),
            None => {
                return Ok(status_error(
                    request_id,
                    &Error::InvalidHandle("no such handle".to_string()),
                ));
            }
        };

        match self.fs.chattr(&vpath, attrs.changes()).await {
            Ok(()) => Ok(status(request_id, StatusCode::Ok, "Success")),
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_opendir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            warn!(path, "handle table full");
            return Ok(status(
                request_id,
                StatusCode::Failure,
                "too many open handles",
            ));
        }

        // The whole listing is materialized here; an error during
        // enumeration fails OPENDIR instead of producing partial results.
        match self.fs.list(&path).await {
            Ok(entries) => {
                let id = self.insert_handle(SessionHandle::Dir {
                    vpath: path,
                    entries,
                    cursor: 0,
                });
                Ok(handle_response(request_id, id))
            }
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    fn handle_readdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let id = take_handle_id(buf)?;

        match self.handles.get_mut(&id) {
            Some(SessionHandle::Dir { entries, cursor, .. }) => {
                if *cursor >= entries.len() {
                    return Ok(status(request_id, StatusCode::Eof, "End of directory"));
                }

                let end = (*cursor + READDIR_CHUNK).min(entries.len());
                let page = &entries[*cursor..end];

                let mut body = BytesMut::new();
                body.put_u8(PacketType::Name.as_u8());
                body.put_u32(request_id);
                body.put_u32(page.len() as u32);
                for entry in page {
                    codec::put_string(&mut body, &entry.name);
                    codec::put_string(&mut body, &entry.name); // longname
                    WireAttrs::from(entry.attrs).encode_into(&mut body);
                }

                *cursor = end;
                Ok(frame(&body))
            }
            Some(SessionHandle::File { .. }) => Ok(status_error(
                request_id,
                &Error::InvalidHandle("not a directory handle".to_string()),
            )),
            None => Ok(status_error(
                request_id,
                &Error::InvalidHandle("no such handle".to_string()),
            )),
        }
    }

    async fn handle_remove(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;

        match self.fs.remove(&path).await {
            Ok(()) => {
                info!(path, "file removed");
                Ok(status(request_id, StatusCode::Ok, "Success"))
            }
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_mkdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;
        let attrs = WireAttrs::decode(buf)?;

        match self.fs.mkdir(&path, attrs.changes()).await {
            Ok(()) => {
                info!(path, "directory created");
                Ok(status(request_id, StatusCode::Ok, "Success"))
            }
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    async fn handle_rmdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;

        match self.fs.rmdir(&path).await {
            Ok(()) => {
                info!(path, "directory removed");
                Ok(status(request_id, StatusCode::Ok, "Success"))
            }
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    fn handle_realpath(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;

        let resolved = normalize_virtual(&path);

        let mut body = BytesMut::new();
        body.put_u8(PacketType::Name.as_u8());
        body.put_u32(request_id);
        body.put_u32(1);
        codec::put_string(&mut body, &resolved);
        codec::put_string(&mut body, &resolved);
        WireAttrs::default().encode_into(&mut body);
        Ok(frame(&body))
    }

    async fn handle_rename(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let from = codec::take_string(buf)?;
        let to = codec::take_string(buf)?;

        match self.fs.rename(&from, &to).await {
            Ok(()) => {
                info!(from, to, "renamed");
                Ok(status(request_id, StatusCode::Ok, "Success"))
            }
            Err(e) => Ok(status_error(request_id, &e)),
        }
    }

    fn handle_readlink(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let path = codec::take_string(buf)?;

        // Rejected by policy, not by accident.
        debug!(path, "readlink rejected");
        Ok(status(
            request_id,
            StatusCode::OpUnsupported,
            "symbolic links are not supported",
        ))
    }

    fn handle_symlink(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::take_u32(buf)?;
        let link = codec::take_string(buf)?;
        let target = codec::take_string(buf)?;

        debug!(link, target, "symlink rejected");
        Ok(status(
            request_id,
            StatusCode::OpUnsupported,
            "symbolic links are not supported",
        ))
    }

    fn insert_handle(&mut self, handle: SessionHandle) -> u32 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.handles.insert(id, handle);
        id
    }

    fn file_handle(&self, id: u32) -> Result<Arc<FileHandle>> {
        match self.handles.get(&id) {
            Some(SessionHandle::File { file, .. }) => Ok(file.clone()),
            Some(SessionHandle::Dir { .. }) => {
                Err(Error::InvalidHandle("not a file handle".to_string()))
            }
            None => Err(Error::InvalidHandle("no such handle".to_string())),
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            debug!(
                open_handles = self.handles.len(),
                "session torn down with open handles"
            );
        }
    }
}

fn take_handle_id(buf: &mut &[u8]) -> Result<u32> {
    let raw = codec::take_bytes(buf)?;
    let bytes: [u8; 4] = raw
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidHandle("malformed handle".to_string()))?;
    Ok(u32::from_be_bytes(bytes))
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn status(request_id: u32, code: StatusCode, message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(PacketType::Status.as_u8());
    body.put_u32(request_id);
    body.put_u32(code as u32);
    codec::put_string(&mut body, message);
    codec::put_string(&mut body, "en");
    frame(&body)
}

fn status_error(request_id: u32, err: &Error) -> Vec<u8> {
    if err.is_security_event() {
        warn!(error = %err, "request denied");
    } else {
        debug!(error = %err, "request failed");
    }
    status(request_id, StatusCode::for_error(err), &err.sanitized_message())
}

fn handle_response(request_id: u32, id: u32) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(PacketType::Handle.as_u8());
    body.put_u32(request_id);
    codec::put_bytes(&mut body, &id.to_be_bytes());
    frame(&body)
}

fn data_response(request_id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(PacketType::Data.as_u8());
    body.put_u32(request_id);
    codec::put_bytes(&mut body, data);
    frame(&body)
}

fn attrs_response(request_id: u32, attrs: WireAttrs) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(PacketType::Attrs.as_u8());
    body.put_u32(request_id);
    attrs.encode_into(&mut body);
    frame(&body)
}
