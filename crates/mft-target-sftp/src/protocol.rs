//! SFTP version 3 wire format (draft-ietf-secsh-filexfer-02).
//!
//! Request packets arrive as SSH channel data and are length-framed:
//! `uint32 length, byte type, payload`. [`PacketBuffer`] reassembles
//! packets across channel data events; the codec helpers read and write
//! the protocol's length-prefixed strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mft_target_core::{AttrChanges, Error, FileAttributes, OpenRequest, Result};

/// Protocol version spoken by this server.
pub const VERSION: u32 = 3;

/// Upper bound on a single packet; anything larger is a protocol error.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// SFTP packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Init,
    Version,
    Open,
    Close,
    Read,
    Write,
    Lstat,
    Fstat,
    Setstat,
    Fsetstat,
    Opendir,
    Readdir,
    Remove,
    Mkdir,
    Rmdir,
    Realpath,
    Stat,
    Rename,
    Readlink,
    Symlink,
    Status,
    Handle,
    Data,
    Name,
    Attrs,
    Extended,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Init => 1,
            Self::Version => 2,
            Self::Open => 3,
            Self::Close => 4,
            Self::Read => 5,
            Self::Write => 6,
            Self::Lstat => 7,
            Self::Fstat => 8,
            Self::Setstat => 9,
            Self::Fsetstat => 10,
            Self::Opendir => 11,
            Self::Readdir => 12,
            Self::Remove => 13,
            Self::Mkdir => 14,
            Self::Rmdir => 15,
            Self::Realpath => 16,
            Self::Stat => 17,
            Self::Rename => 18,
            Self::Readlink => 19,
            Self::Symlink => 20,
            Self::Status => 101,
            Self::Handle => 102,
            Self::Data => 103,
            Self::Name => 104,
            Self::Attrs => 105,
            Self::Extended => 200,
        }
    }
}

/// SSH_FXP_STATUS codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    /// Deterministic mapping from the domain taxonomy; anything without a
    /// dedicated code is the generic failure. An OS error can therefore
    /// never come back as `Ok`.
    pub fn for_error(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => Self::NoSuchFile,
            Error::AccessDenied(_) | Error::PermissionDenied(_) | Error::Authentication(_) => {
                Self::PermissionDenied
            }
            Error::Unsupported(_) => Self::OpUnsupported,
            Error::InvalidPath(_) | Error::InvalidHandle(_) | Error::Protocol(_) => {
                Self::BadMessage
            }
            Error::Connection(_) => Self::ConnectionLost,
            Error::AlreadyExists(_)
            | Error::DirectoryNotEmpty(_)
            | Error::Config(_)
            | Error::Timeout(_)
            | Error::Io(_) => Self::Failure,
        }
    }
}

/// SSH_FXF_* open flags.
pub mod pflags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;
}

/// Decode wire open flags into the adapter's open request.
pub fn decode_pflags(bits: u32) -> OpenRequest {
    OpenRequest {
        read: bits & pflags::READ != 0,
        write: bits & pflags::WRITE != 0,
        append: bits & pflags::APPEND != 0,
        create: bits & pflags::CREAT != 0,
        truncate: bits & pflags::TRUNC != 0,
        exclusive: bits & pflags::EXCL != 0,
    }
}

/// File attributes as they travel on the wire. Field presence is governed
/// by the leading flag word; uid/gid and atime/mtime only travel as pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireAttrs {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    pub times: Option<(u32, u32)>,
}

const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UIDGID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACMODTIME: u32 = 0x0000_0008;

impl WireAttrs {
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let flags = codec::take_u32(buf)?;
        let mut attrs = Self::default();

        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(codec::take_u64(buf)?);
        }
        if flags & ATTR_UIDGID != 0 {
            let uid = codec::take_u32(buf)?;
            let gid = codec::take_u32(buf)?;
            attrs.uid_gid = Some((uid, gid));
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::take_u32(buf)?);
        }
        if flags & ATTR_ACMODTIME != 0 {
            let atime = codec::take_u32(buf)?;
            let mtime = codec::take_u32(buf)?;
            attrs.times = Some((atime, mtime));
        }

        Ok(attrs)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= ATTR_ACMODTIME;
        }
        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    /// Attribute changes requested by SETSTAT/FSETSTAT.
    pub fn changes(&self) -> AttrChanges {
        AttrChanges {
            mode: self.permissions,
            uid: self.uid_gid.map(|(uid, _)| uid),
            gid: self.uid_gid.map(|(_, gid)| gid),
        }
    }
}

impl From<FileAttributes> for WireAttrs {
    fn from(attrs: FileAttributes) -> Self {
        Self {
            size: Some(attrs.size),
            uid_gid: Some((attrs.uid, attrs.gid)),
            permissions: Some(attrs.mode),
            times: Some((attrs.atime, attrs.mtime)),
        }
    }
}

/// Reassembles `uint32`-framed packets from SSH channel data events.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: BytesMut,
}

impl PacketBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete packet payload (type byte onward), or `None` while the
    /// frame is still partial.
    pub fn try_next(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(Error::Protocol("zero-length packet".to_string()));
        }
        if len > MAX_PACKET_LEN {
            return Err(Error::Protocol(format!("packet of {len} bytes exceeds limit")));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Length-prefixed primitives shared by requests and responses.
pub mod codec {
    use super::*;

    pub fn take_u32(buf: &mut &[u8]) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("truncated u32".to_string()));
        }
        Ok(buf.get_u32())
    }

    pub fn take_u64(buf: &mut &[u8]) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(Error::Protocol("truncated u64".to_string()));
        }
        Ok(buf.get_u64())
    }

    pub fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = take_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::Protocol("truncated string".to_string()));
        }
        let out = buf[..len].to_vec();
        buf.advance(len);
        Ok(out)
    }

    pub fn take_string(buf: &mut &[u8]) -> Result<String> {
        String::from_utf8(take_bytes(buf)?)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 string: {e}")))
    }

    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    pub fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }
}
