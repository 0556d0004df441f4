//! SFTP version 3 over a session channel.
//!
//! Every packet is `length:u32 | type:u8 | payload`, the length excluding
//! itself. Requests carry an id the answer repeats; INIT and VERSION don't.

use std::collections::HashMap;

use bitflags::bitflags;
use derive_new::new;

use crate::{
    channel::Channel,
    error::{builder, Error, Result},
    ssh::{buffer::Buffer, common::code::*},
};

mod client;
mod file;
mod server;

pub use client::SftpClient;
pub use file::SftpFile;
pub use server::{FilesystemInterface, SftpHandle, SftpServer};

/// Largest data block moved by one READ or WRITE.
pub(crate) const MAX_REQUEST_SIZE: u32 = 32768;
/// Packets above this are treated as a broken stream.
pub(crate) const MAX_PACKET_SIZE: u32 = 256 * 1024;

pub(crate) const EXT_CHECK_FILE: &str = "check-file";
pub(crate) const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";

bitflags! {
    // https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02#section-6.3
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ                        = SSH_FXF_READ;
        const WRITE                       = SSH_FXF_WRITE;
        // every write goes to the end of the file
        const APPEND                      = SSH_FXF_APPEND;
        const CREAT                       = SSH_FXF_CREAT;
        // CREAT must be set as well
        const TRUNC                       = SSH_FXF_TRUNC;
        // fail if the file exists, CREAT must be set as well
        const EXCL                        = SSH_FXF_EXCL;
    }
}

impl OpenFlags {
    /// Flags for an fopen style mode: `r`, `r+`, `w`, `w+`, `a`, `a+`, `x`.
    pub fn from_mode(mode: &str) -> Result<Self> {
        let mode = mode.replace('b', "");
        Ok(match mode.as_str() {
            "r" => Self::READ,
            "r+" => Self::READ | Self::WRITE,
            "w" => Self::WRITE | Self::CREAT | Self::TRUNC,
            "w+" => Self::READ | Self::WRITE | Self::CREAT | Self::TRUNC,
            "a" => Self::WRITE | Self::CREAT | Self::APPEND,
            "a+" => Self::READ | Self::WRITE | Self::CREAT | Self::APPEND,
            "x" => Self::WRITE | Self::CREAT | Self::EXCL,
            _ => return Err(Error::invalid_argument(format!("invalid open mode {mode}"))),
        })
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const OTHER_EXEC                        = 1 << 0;
        const OTHER_WRITE                       = 1 << 1;
        const OTHER_READ                        = 1 << 2;

        const GROUP_EXEC                        = 1 << 0 << 3;
        const GROUP_WRITE                       = 1 << 1 << 3;
        const GROUP_READ                        = 1 << 2 << 3;

        const OWNER_EXEC                        = 1 << 0 << 6;
        const OWNER_WRITE                       = 1 << 1 << 6;
        const OWNER_READ                        = 1 << 2 << 6;

        const STICKY                            = 0o1000;
        const SETGID                            = 0o2000;
        const SETUID                            = 0o4000;

        const FILE_TYPE                         = 0o170000;
        const DIRECTORY                         = 0o040000;
        const REGULAR                           = 0o100000;
        const SYMLINK                           = 0o120000;
    }
}

impl Permissions {
    pub fn p0755() -> Self {
        Self::from_bits_retain(0o755)
    }

    pub fn p0644() -> Self {
        Self::from_bits_retain(0o644)
    }

    fn file_type(&self) -> u32 {
        self.bits() & Self::FILE_TYPE.bits()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Self::DIRECTORY.bits()
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == Self::REGULAR.bits()
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == Self::SYMLINK.bits()
    }

    /// `drwxr-xr-x` style rendering.
    pub fn mode_string(&self) -> String {
        let kind = if self.is_dir() {
            'd'
        } else if self.is_symlink() {
            'l'
        } else {
            '-'
        };
        let bits = self.bits();
        let mut out = String::with_capacity(10);
        out.push(kind);
        for shift in [6, 3, 0] {
            let part = (bits >> shift) & 0o7;
            out.push(if part & 0o4 != 0 { 'r' } else { '-' });
            out.push(if part & 0o2 != 0 { 'w' } else { '-' });
            out.push(if part & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }
}

#[derive(new, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub atime: u32,
    pub mtime: u32,
}

#[derive(new, Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

/// File attributes. Times are whole seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub size: Option<u64>,
    pub user: Option<User>,
    pub permissions: Option<Permissions>,
    pub time: Option<Timestamp>,
    pub extended: HashMap<String, Vec<u8>>,
}

impl Attributes {
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some(User::new(uid, gid));
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_time(mut self, atime: u32, mtime: u32) -> Self {
        self.time = Some(Timestamp::new(atime, mtime));
        self
    }

    pub fn is_dir(&self) -> bool {
        self.permissions.map(|p| p.is_dir()).unwrap_or_default()
    }

    pub fn is_file(&self) -> bool {
        self.permissions.map(|p| p.is_file()).unwrap_or_default()
    }

    /// An `ls -l` style line for NAME replies.
    pub fn long_name(&self, filename: &str) -> String {
        let mode = self
            .permissions
            .map(|p| p.mode_string())
            .unwrap_or_else(|| "?---------".to_string());
        let (uid, gid) = self.user.map(|u| (u.uid, u.gid)).unwrap_or_default();
        let mtime = self.time.map(|t| t.mtime).unwrap_or_default();
        format!(
            "{mode}   1 {uid:<8} {gid:<8} {:>8} {mtime:>10} {filename}",
            self.size.unwrap_or_default()
        )
    }

    pub(crate) fn to_bytes(&self, buffer: &mut Buffer) {
        let mut flags = 0;
        let mut tmp = Buffer::new();
        if let Some(size) = self.size {
            flags |= SSH_FILEXFER_ATTR_SIZE;
            tmp.put_u64(size);
        }
        if let Some(user) = self.user {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
            tmp.put_u32(user.uid);
            tmp.put_u32(user.gid);
        }
        if let Some(permissions) = self.permissions {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
            tmp.put_u32(permissions.bits());
        }
        if let Some(time) = self.time {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
            tmp.put_u32(time.atime);
            tmp.put_u32(time.mtime);
        }
        if !self.extended.is_empty() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
            tmp.put_u32(self.extended.len() as u32);
            for (k, v) in &self.extended {
                tmp.put_one(k);
                tmp.put_one(v);
            }
        }
        buffer.put_u32(flags);
        buffer.put_bytes(tmp);
    }

    pub(crate) fn parse(buffer: &Buffer<&[u8]>) -> Option<Self> {
        let flags = buffer.take_u32()?;
        let mut attrs = Self::default();

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(buffer.take_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.user = Some(User::new(buffer.take_u32()?, buffer.take_u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(Permissions::from_bits_retain(buffer.take_u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.time = Some(Timestamp::new(buffer.take_u32()?, buffer.take_u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = buffer.take_u32()?;
            for _ in 0..count {
                let key = buffer.take_string()?;
                let value = buffer.take_one()?.1.to_vec();
                attrs.extended.insert(key, value);
            }
        }
        Some(attrs)
    }
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub longname: String,
    pub attrs: Attributes,
}

/// Status codes of SSH_FXP_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Status {
    Ok = SSH_FX_OK,
    Eof = SSH_FX_EOF,
    NoSuchFile = SSH_FX_NO_SUCH_FILE,
    PermissionDenied = SSH_FX_PERMISSION_DENIED,
    Failure = SSH_FX_FAILURE,
    BadMessage = SSH_FX_BAD_MESSAGE,
    NoConnection = SSH_FX_NO_CONNECTION,
    ConnectionLost = SSH_FX_CONNECTION_LOST,
    OpUnsupported = SSH_FX_OP_UNSUPPORTED,
}

impl Status {
    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            SSH_FX_OK => Self::Ok,
            SSH_FX_EOF => Self::Eof,
            SSH_FX_NO_SUCH_FILE => Self::NoSuchFile,
            SSH_FX_PERMISSION_DENIED => Self::PermissionDenied,
            SSH_FX_BAD_MESSAGE => Self::BadMessage,
            SSH_FX_NO_CONNECTION => Self::NoConnection,
            SSH_FX_CONNECTION_LOST => Self::ConnectionLost,
            SSH_FX_OP_UNSUPPORTED => Self::OpUnsupported,
            _ => Self::Failure,
        }
    }

    pub(crate) fn text(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation unsupported",
        }
    }

    /// `Ok` maps to `Ok(())`, everything else to the matching error.
    pub(crate) fn to_result(self, msg: String) -> Result<()> {
        let tip = if msg.is_empty() {
            self.text().to_string()
        } else {
            msg
        };
        match self {
            Self::Ok => Ok(()),
            Self::Eof => builder::SFtpFailure { tip }.fail(),
            Self::NoSuchFile => builder::NoSuchFile { tip }.fail(),
            Self::PermissionDenied => builder::PermissionDenied { tip }.fail(),
            Self::Failure => builder::SFtpFailure { tip }.fail(),
            Self::BadMessage => builder::BadMessage { tip }.fail(),
            Self::NoConnection => builder::NoConnection { tip }.fail(),
            Self::ConnectionLost => builder::ConnectionLost { tip }.fail(),
            Self::OpUnsupported => builder::OpUnsupported { tip }.fail(),
        }
    }

    /// The status a server reports for a failed operation.
    pub(crate) fn of_error(err: &Error) -> Self {
        match err {
            Error::NoSuchFile { .. } => Self::NoSuchFile,
            Error::PermissionDenied { .. } => Self::PermissionDenied,
            Error::BadMessage { .. } => Self::BadMessage,
            Error::NoConnection { .. } => Self::NoConnection,
            Error::ConnectionLost { .. } => Self::ConnectionLost,
            Error::OpUnsupported { .. } => Self::OpUnsupported,
            Error::Io { source } => match source.kind() {
                std::io::ErrorKind::NotFound => Self::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                std::io::ErrorKind::Unsupported => Self::OpUnsupported,
                _ => Self::Failure,
            },
            _ => Self::Failure,
        }
    }
}

/// A server's answer to one request.
#[derive(custom_debug_derive::Debug)]
pub(crate) enum Reply {
    Status { status: Status, msg: String },
    Handle(Vec<u8>),
    Data(#[debug(skip)] Vec<u8>),
    Name(Vec<FileInfo>),
    Attrs(Attributes),
    Extended(#[debug(skip)] Vec<u8>),
}

fn unexpected<T>(reply: Reply) -> Result<T> {
    Err(Error::BadMessage {
        tip: format!("unexpected reply {reply:?}"),
    })
}

impl Reply {
    /// Parses the payload of a reply packet (after the length) into its
    /// request id and content.
    pub(crate) fn parse(packet: &[u8]) -> Option<(u32, Self)> {
        let buffer = Buffer::from_slice(packet);
        let code = buffer.take_u8()?;
        let id = buffer.take_u32()?;

        let reply = match code {
            SSH_FXP_STATUS => Self::Status {
                status: Status::from_code(buffer.take_u32()?),
                // some servers leave out message and language
                msg: buffer.take_string().unwrap_or_default(),
            },
            SSH_FXP_HANDLE => Self::Handle(buffer.take_one()?.1.to_vec()),
            SSH_FXP_DATA => Self::Data(buffer.take_one()?.1.to_vec()),
            SSH_FXP_NAME => {
                let count = buffer.take_u32()?;
                let mut names = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let filename = buffer.take_string()?;
                    let longname = buffer.take_string()?;
                    names.push(FileInfo::new(filename, longname, Attributes::parse(&buffer)?));
                }
                Self::Name(names)
            }
            SSH_FXP_ATTRS => Self::Attrs(Attributes::parse(&buffer)?),
            SSH_FXP_EXTENDED_REPLY => Self::Extended(buffer.remaining().to_vec()),
            _ => return None,
        };
        Some((id, reply))
    }

    pub(crate) fn into_status(self) -> Result<()> {
        match self {
            Self::Status { status, msg } => status.to_result(msg),
            reply => unexpected(reply),
        }
    }

    pub(crate) fn into_handle(self) -> Result<Vec<u8>> {
        match self {
            Self::Handle(handle) => Ok(handle),
            reply => reply.into_status().and_then(|_| unexpected(Self::Handle(vec![]))),
        }
    }

    /// `None` at end of file.
    pub(crate) fn into_data(self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Data(data) => Ok(Some(data)),
            Self::Status {
                status: Status::Eof,
                ..
            } => Ok(None),
            reply => reply.into_status().and_then(|_| unexpected(Self::Data(vec![]))),
        }
    }

    /// `None` once a directory listing is exhausted.
    pub(crate) fn into_name(self) -> Result<Option<Vec<FileInfo>>> {
        match self {
            Self::Name(names) => Ok(Some(names)),
            Self::Status {
                status: Status::Eof,
                ..
            } => Ok(None),
            reply => reply.into_status().and_then(|_| unexpected(Self::Name(vec![]))),
        }
    }

    pub(crate) fn into_attrs(self) -> Result<Attributes> {
        match self {
            Self::Attrs(attrs) => Ok(attrs),
            reply => reply.into_status().and_then(|_| unexpected(Self::Attrs(Attributes::default()))),
        }
    }

    pub(crate) fn into_extended(self) -> Result<Vec<u8>> {
        match self {
            Self::Extended(data) => Ok(data),
            reply => reply.into_status().and_then(|_| unexpected(Self::Extended(vec![]))),
        }
    }
}

/// Frames one packet: length, type and body.
pub(crate) fn packet(code: u8, body: &[u8]) -> Vec<u8> {
    let mut buffer = Buffer::with_capacity(5 + body.len());
    buffer.put_u32(1 + body.len() as u32);
    buffer.put_u8(code);
    buffer.put_bytes(body);
    buffer.into_vec()
}

/// Reads one packet (type and body) off the channel. `None` when the peer
/// finished cleanly between packets.
pub(crate) async fn read_packet(channel: &Channel) -> Result<Option<Vec<u8>>> {
    let head = match channel.read_exact(4).await {
        Ok(head) => head,
        Err(Error::ChannelEof | Error::ChannelClosed) => return Ok(None),
        Err(err) => return Err(err),
    };
    let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    if len == 0 || len > MAX_PACKET_SIZE {
        return Err(Error::BadMessage {
            tip: format!("invalid sftp packet length {len}"),
        });
    }
    let body = channel.read_exact(len as usize).await.map_err(|err| match err {
        Error::ChannelEof | Error::ChannelClosed => Error::ConnectionLost {
            tip: "sftp stream ended inside a packet".to_string(),
        },
        err => err,
    })?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_wire_format() {
        let mut attrs = Attributes::default()
            .with_size(1 << 33)
            .with_permissions(Permissions::REGULAR | Permissions::p0644())
            .with_time(10, 20);
        attrs.extended.insert("x@example".into(), b"y".to_vec());

        let mut buffer = Buffer::new();
        attrs.to_bytes(&mut buffer);
        let bytes = buffer.into_vec();
        assert_eq!(
            &bytes[..4],
            &(SSH_FILEXFER_ATTR_SIZE
                | SSH_FILEXFER_ATTR_PERMISSIONS
                | SSH_FILEXFER_ATTR_ACMODTIME
                | SSH_FILEXFER_ATTR_EXTENDED)
                .to_be_bytes()
        );
        let parsed = Attributes::parse(&Buffer::from_slice(&bytes)).unwrap();
        assert_eq!(parsed, attrs);
        assert!(parsed.is_file());
        assert!(!parsed.is_dir());

        let empty = Attributes::parse(&Buffer::from_slice(&[0, 0, 0, 0])).unwrap();
        assert_eq!(empty, Attributes::default());
        assert!(Attributes::parse(&Buffer::from_slice(&[0, 0, 0, 1, 0])).is_none());
    }

    #[test]
    fn mode_strings() {
        let dir = Permissions::DIRECTORY | Permissions::p0755();
        assert_eq!(dir.mode_string(), "drwxr-xr-x");
        assert_eq!(Permissions::p0644().mode_string(), "-rw-r--r--");
        let attrs = Attributes::default()
            .with_permissions(dir)
            .with_user(0, 0)
            .with_size(4096);
        assert!(attrs.long_name("etc").starts_with("drwxr-xr-x"));
        assert!(attrs.long_name("etc").ends_with(" etc"));
    }

    #[test]
    fn open_modes() {
        assert_eq!(OpenFlags::from_mode("rb").unwrap(), OpenFlags::READ);
        assert_eq!(
            OpenFlags::from_mode("w").unwrap(),
            OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC
        );
        assert!(OpenFlags::from_mode("a+")
            .unwrap()
            .contains(OpenFlags::APPEND | OpenFlags::READ));
        assert!(OpenFlags::from_mode("q").is_err());
    }

    #[test]
    fn status_replies() {
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_FXP_STATUS);
        buffer.put_u32(7);
        buffer.put_u32(SSH_FX_NO_SUCH_FILE);
        buffer.put_one("gone");
        buffer.put_one("");
        let (id, reply) = Reply::parse(buffer.as_ref()).unwrap();
        assert_eq!(id, 7);
        match reply.into_attrs() {
            Err(Error::NoSuchFile { tip }) => assert_eq!(tip, "gone"),
            other => panic!("unexpected {other:?}"),
        }

        // status without message
        let (_, reply) = Reply::parse(&[SSH_FXP_STATUS, 0, 0, 0, 1, 0, 0, 0, 1]).unwrap();
        assert!(matches!(reply.into_data(), Ok(None)));
        let (_, reply) = Reply::parse(&[SSH_FXP_STATUS, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap();
        assert!(reply.into_status().is_ok());

        let err: std::io::Error = Status::PermissionDenied
            .to_result(String::new())
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn status_of_errors() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(Status::of_error(&err), Status::NoSuchFile);
        assert_eq!(
            Status::of_error(&Error::OpUnsupported { tip: "x".into() }),
            Status::OpUnsupported
        );
        assert_eq!(Status::of_error(&Error::Timeout), Status::Failure);
    }

    #[test]
    fn framing() {
        let framed = packet(SSH_FXP_INIT, &3u32.to_be_bytes());
        assert_eq!(framed, [0, 0, 0, 5, SSH_FXP_INIT, 0, 0, 0, 3]);
    }
}
