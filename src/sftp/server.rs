use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use openssl::md::{Md, MdRef};

use crate::{
    channel::Channel,
    cipher::hash::{Hash, MdWrapper},
    error::{Error, Result},
    server::SubsystemHandler,
    ssh::{
        buffer::Buffer,
        common::{code::*, SFTP_VERSION},
    },
};

use super::{
    packet, read_packet, Attributes, FileInfo, OpenFlags, Reply, Status, EXT_CHECK_FILE,
    EXT_POSIX_RENAME, MAX_REQUEST_SIZE,
};

/// Entries sent per READDIR answer.
const NAMES_PER_READDIR: usize = 16;
/// Smallest block `check-file` hashes separately.
const MIN_CHECK_BLOCK: u32 = 256;

fn unsupported<T>(what: &str) -> Result<T> {
    Err(Error::OpUnsupported {
        tip: format!("{what} is not supported"),
    })
}

/// An open file on the serving side.
#[async_trait]
pub trait SftpHandle: Send + Sync {
    /// Up to `len` bytes at `offset`, empty at end of file.
    async fn read(&mut self, _offset: u64, _len: u32) -> Result<Vec<u8>> {
        unsupported("read")
    }

    async fn write(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        unsupported("write")
    }

    async fn stat(&mut self) -> Result<Attributes> {
        unsupported("fstat")
    }

    async fn chattr(&mut self, _attrs: &Attributes) -> Result<()> {
        unsupported("fsetstat")
    }

    /// Called on CLOSE and for handles still open when the session ends.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The filesystem an [`SftpServer`] exposes. Paths come as the client sent
/// them; errors become the matching STATUS code.
#[async_trait]
pub trait FilesystemInterface: Send + Sync {
    async fn session_started(&self) {}

    async fn session_ended(&self) {}

    async fn open(
        &self,
        _path: &str,
        _flags: OpenFlags,
        _attrs: &Attributes,
    ) -> Result<Box<dyn SftpHandle>> {
        unsupported("open")
    }

    /// Entries of a directory. An empty `longname` is filled in from the
    /// attributes.
    async fn list_folder(&self, _path: &str) -> Result<Vec<FileInfo>> {
        unsupported("opendir")
    }

    async fn stat(&self, _path: &str) -> Result<Attributes> {
        unsupported("stat")
    }

    /// Like `stat` without following a final symlink.
    async fn lstat(&self, path: &str) -> Result<Attributes> {
        self.stat(path).await
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        unsupported("remove")
    }

    async fn rename(&self, _old: &str, _new: &str) -> Result<()> {
        unsupported("rename")
    }

    /// Rename that replaces an existing target.
    async fn posix_rename(&self, old: &str, new: &str) -> Result<()> {
        self.rename(old, new).await
    }

    async fn mkdir(&self, _path: &str, _attrs: &Attributes) -> Result<()> {
        unsupported("mkdir")
    }

    async fn rmdir(&self, _path: &str) -> Result<()> {
        unsupported("rmdir")
    }

    async fn chattr(&self, _path: &str, _attrs: &Attributes) -> Result<()> {
        unsupported("setstat")
    }

    /// Absolute form of `path`. Resolves `.` and `..` without touching the
    /// filesystem unless overridden.
    async fn canonicalize(&self, path: &str) -> Result<String> {
        Ok(normalize(path))
    }

    async fn readlink(&self, _path: &str) -> Result<String> {
        unsupported("readlink")
    }

    async fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        unsupported("symlink")
    }
}

/// Lexical absolute path, relative ones taken from `/`.
pub(crate) fn normalize(path: &str) -> String {
    let mut parts = vec![];
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// One decoded request, owning its arguments.
#[derive(custom_debug_derive::Debug)]
enum Op {
    Open { path: String, flags: OpenFlags, attrs: Attributes },
    Close { handle: Vec<u8> },
    Read { handle: Vec<u8>, offset: u64, len: u32 },
    Write {
        handle: Vec<u8>,
        offset: u64,
        #[debug(skip)]
        data: Vec<u8>,
    },
    Lstat { path: String },
    Fstat { handle: Vec<u8> },
    Setstat { path: String, attrs: Attributes },
    Fsetstat { handle: Vec<u8>, attrs: Attributes },
    Opendir { path: String },
    Readdir { handle: Vec<u8> },
    Remove { path: String },
    Mkdir { path: String, attrs: Attributes },
    Rmdir { path: String },
    Realpath { path: String },
    Stat { path: String },
    Rename { old: String, new: String },
    Readlink { path: String },
    Symlink { target: String, link: String },
    CheckFile {
        handle: Vec<u8>,
        algorithms: Vec<String>,
        offset: u64,
        length: u64,
        block_size: u32,
    },
    PosixRename { old: String, new: String },
    Unsupported(String),
}

impl Op {
    /// `None` for a malformed body.
    fn parse(code: u8, buffer: &Buffer<&[u8]>) -> Option<Self> {
        let path = || buffer.take_string();
        let handle = || buffer.take_one().map(|(_, h)| h.to_vec());

        Some(match code {
            SSH_FXP_OPEN => Self::Open {
                path: path()?,
                flags: OpenFlags::from_bits_truncate(buffer.take_u32()?),
                attrs: Attributes::parse(buffer)?,
            },
            SSH_FXP_CLOSE => Self::Close { handle: handle()? },
            SSH_FXP_READ => Self::Read {
                handle: handle()?,
                offset: buffer.take_u64()?,
                len: buffer.take_u32()?,
            },
            SSH_FXP_WRITE => Self::Write {
                handle: handle()?,
                offset: buffer.take_u64()?,
                data: buffer.take_one()?.1.to_vec(),
            },
            SSH_FXP_LSTAT => Self::Lstat { path: path()? },
            SSH_FXP_FSTAT => Self::Fstat { handle: handle()? },
            SSH_FXP_SETSTAT => Self::Setstat {
                path: path()?,
                attrs: Attributes::parse(buffer)?,
            },
            SSH_FXP_FSETSTAT => Self::Fsetstat {
                handle: handle()?,
                attrs: Attributes::parse(buffer)?,
            },
            SSH_FXP_OPENDIR => Self::Opendir { path: path()? },
            SSH_FXP_READDIR => Self::Readdir { handle: handle()? },
            SSH_FXP_REMOVE => Self::Remove { path: path()? },
            SSH_FXP_MKDIR => Self::Mkdir {
                path: path()?,
                attrs: Attributes::parse(buffer).unwrap_or_default(),
            },
            SSH_FXP_RMDIR => Self::Rmdir { path: path()? },
            SSH_FXP_REALPATH => Self::Realpath { path: path()? },
            SSH_FXP_STAT => Self::Stat { path: path()? },
            SSH_FXP_RENAME => Self::Rename {
                old: path()?,
                new: path()?,
            },
            SSH_FXP_READLINK => Self::Readlink { path: path()? },
            SSH_FXP_SYMLINK => Self::Symlink {
                target: path()?,
                link: path()?,
            },
            SSH_FXP_EXTENDED => {
                let name = buffer.take_string()?;
                match name.as_str() {
                    EXT_CHECK_FILE => Self::CheckFile {
                        handle: handle()?,
                        algorithms: buffer
                            .take_str()?
                            .split(',')
                            .map(str::to_string)
                            .collect(),
                        offset: buffer.take_u64()?,
                        length: buffer.take_u64()?,
                        block_size: buffer.take_u32()?,
                    },
                    EXT_POSIX_RENAME => Self::PosixRename {
                        old: path()?,
                        new: path()?,
                    },
                    _ => Self::Unsupported(format!("extension {name}")),
                }
            }
            code => Self::Unsupported(format!("request type {code}")),
        })
    }
}

fn put_names(buffer: &mut Buffer, names: &[FileInfo]) {
    buffer.put_u32(names.len() as u32);
    for info in names {
        buffer.put_one(&info.filename);
        if info.longname.is_empty() {
            buffer.put_one(info.attrs.long_name(&info.filename));
        } else {
            buffer.put_one(&info.longname);
        }
        info.attrs.to_bytes(buffer);
    }
}

/// Frames the answer to request `id`.
fn encode_reply(id: u32, reply: &Reply) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_u32(id);
    let code = match reply {
        Reply::Status { status, msg } => {
            buffer.put_u32(*status as u32);
            buffer.put_one(msg);
            buffer.put_one("");
            SSH_FXP_STATUS
        }
        Reply::Handle(handle) => {
            buffer.put_one(handle);
            SSH_FXP_HANDLE
        }
        Reply::Data(data) => {
            buffer.put_one(data);
            SSH_FXP_DATA
        }
        Reply::Name(names) => {
            put_names(&mut buffer, names);
            SSH_FXP_NAME
        }
        Reply::Attrs(attrs) => {
            attrs.to_bytes(&mut buffer);
            SSH_FXP_ATTRS
        }
        Reply::Extended(data) => {
            buffer.put_bytes(data);
            SSH_FXP_EXTENDED_REPLY
        }
    };
    packet(code, buffer.as_ref())
}

fn ok() -> Reply {
    Reply::Status {
        status: Status::Ok,
        msg: String::new(),
    }
}

fn eof() -> Reply {
    Reply::Status {
        status: Status::Eof,
        msg: String::new(),
    }
}

fn invalid_handle() -> Error {
    Error::BadMessage {
        tip: "invalid handle".to_string(),
    }
}

enum OpenHandle {
    File(Box<dyn SftpHandle>),
    Dir(Vec<FileInfo>),
}

/// The per channel state of a running subsystem.
struct ServerSession {
    channel: Channel,
    fs: Arc<dyn FilesystemInterface>,
    handles: HashMap<Vec<u8>, OpenHandle>,
    next_handle: u64,
}

impl ServerSession {
    fn insert(&mut self, handle: OpenHandle) -> Vec<u8> {
        self.next_handle += 1;
        let prefix = match handle {
            OpenHandle::File(_) => "hf",
            OpenHandle::Dir(_) => "hd",
        };
        let name = format!("{prefix}{}", self.next_handle).into_bytes();
        self.handles.insert(name.clone(), handle);
        name
    }

    fn file(&mut self, handle: &[u8]) -> Result<&mut Box<dyn SftpHandle>> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            _ => Err(invalid_handle()),
        }
    }

    async fn send(&self, id: u32, reply: &Reply) -> Result<()> {
        self.channel.write_all(&encode_reply(id, reply)).await
    }

    async fn handshake(&self) -> Result<bool> {
        let Some(init) = read_packet(&self.channel).await? else {
            return Ok(false);
        };
        let (code, version) = {
            let buffer = Buffer::from_slice(&init);
            (buffer.take_u8(), buffer.take_u32())
        };
        if code != Some(SSH_FXP_INIT) {
            return Err(Error::BadMessage {
                tip: format!("expected INIT, got {code:?}"),
            });
        }
        tracing::debug!("sftp client version {version:?}");

        let mut buffer = Buffer::new();
        buffer.put_u32(SFTP_VERSION);
        buffer.put_one(EXT_CHECK_FILE);
        buffer.put_one("md5,sha1");
        buffer.put_one(EXT_POSIX_RENAME);
        buffer.put_one("1");
        self.channel
            .write_all(&packet(SSH_FXP_VERSION, buffer.as_ref()))
            .await?;
        Ok(true)
    }

    async fn run(&mut self) -> Result<()> {
        if !self.handshake().await? {
            return Ok(());
        }
        while let Some(request) = read_packet(&self.channel).await? {
            let (code, id, op) = {
                let buffer = Buffer::from_slice(&request);
                let code = buffer.take_u8().unwrap_or_default();
                let id = buffer.take_u32();
                let op = Op::parse(code, &buffer);
                (code, id, op)
            };
            let Some(id) = id else {
                return Err(Error::BadMessage {
                    tip: format!("sftp request {code} without id"),
                });
            };
            let reply = match op {
                Some(op) => {
                    tracing::trace!("sftp request {id}: {op:?}");
                    self.execute(op).await.unwrap_or_else(|err| {
                        tracing::debug!("sftp request {id} failed: {err}");
                        Reply::Status {
                            status: Status::of_error(&err),
                            msg: err.to_string(),
                        }
                    })
                }
                None => Reply::Status {
                    status: Status::BadMessage,
                    msg: format!("malformed request of type {code}"),
                },
            };
            self.send(id, &reply).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, op: Op) -> Result<Reply> {
        let fs = self.fs.clone();
        Ok(match op {
            Op::Open { path, flags, attrs } => {
                let file = fs.open(&path, flags, &attrs).await?;
                Reply::Handle(self.insert(OpenHandle::File(file)))
            }
            Op::Close { handle } => match self.handles.remove(&handle) {
                Some(OpenHandle::File(mut file)) => {
                    file.close().await?;
                    ok()
                }
                Some(OpenHandle::Dir(_)) => ok(),
                None => return Err(invalid_handle()),
            },
            Op::Read { handle, offset, len } => {
                let data = self
                    .file(&handle)?
                    .read(offset, len.min(MAX_REQUEST_SIZE))
                    .await?;
                if data.is_empty() {
                    eof()
                } else {
                    Reply::Data(data)
                }
            }
            Op::Write {
                handle,
                offset,
                data,
            } => {
                self.file(&handle)?.write(offset, &data).await?;
                ok()
            }
            Op::Lstat { path } => Reply::Attrs(fs.lstat(&path).await?),
            Op::Stat { path } => Reply::Attrs(fs.stat(&path).await?),
            Op::Fstat { handle } => Reply::Attrs(self.file(&handle)?.stat().await?),
            Op::Setstat { path, attrs } => {
                fs.chattr(&path, &attrs).await?;
                ok()
            }
            Op::Fsetstat { handle, attrs } => {
                self.file(&handle)?.chattr(&attrs).await?;
                ok()
            }
            Op::Opendir { path } => {
                let mut names = fs.list_folder(&path).await?;
                names.reverse();
                Reply::Handle(self.insert(OpenHandle::Dir(names)))
            }
            Op::Readdir { handle } => match self.handles.get_mut(&handle) {
                Some(OpenHandle::Dir(names)) if names.is_empty() => eof(),
                Some(OpenHandle::Dir(names)) => {
                    let keep = names.len().saturating_sub(NAMES_PER_READDIR);
                    let mut batch = names.split_off(keep);
                    batch.reverse();
                    Reply::Name(batch)
                }
                _ => return Err(invalid_handle()),
            },
            Op::Remove { path } => {
                fs.remove(&path).await?;
                ok()
            }
            Op::Mkdir { path, attrs } => {
                fs.mkdir(&path, &attrs).await?;
                ok()
            }
            Op::Rmdir { path } => {
                fs.rmdir(&path).await?;
                ok()
            }
            Op::Realpath { path } => {
                let resolved = fs.canonicalize(&path).await?;
                Reply::Name(vec![FileInfo::new(resolved, String::new(), Attributes::default())])
            }
            Op::Rename { old, new } => {
                fs.rename(&old, &new).await?;
                ok()
            }
            Op::PosixRename { old, new } => {
                fs.posix_rename(&old, &new).await?;
                ok()
            }
            Op::Readlink { path } => {
                let target = fs.readlink(&path).await?;
                Reply::Name(vec![FileInfo::new(target, String::new(), Attributes::default())])
            }
            Op::Symlink { target, link } => {
                fs.symlink(&target, &link).await?;
                ok()
            }
            Op::CheckFile {
                handle,
                algorithms,
                offset,
                length,
                block_size,
            } => self
                .check_file(&handle, &algorithms, offset, length, block_size)
                .await?,
            Op::Unsupported(what) => return unsupported(&what),
        })
    }

    /// Hashes `length` bytes from `offset` in blocks of `block_size`, the
    /// whole range when 0. The answer names the extension, then the
    /// algorithm, then the digests back to back.
    async fn check_file(
        &mut self,
        handle: &[u8],
        algorithms: &[String],
        offset: u64,
        length: u64,
        block_size: u32,
    ) -> Result<Reply> {
        let (name, md): (&str, &'static MdRef) =
            match algorithms.iter().find(|a| matches!(a.as_str(), "md5" | "sha1")) {
                Some(a) if a == "md5" => ("md5", Md::md5()),
                Some(_) => ("sha1", Md::sha1()),
                None => return unsupported("check-file with these algorithms"),
            };
        if block_size != 0 && block_size < MIN_CHECK_BLOCK {
            return Err(Error::SFtpFailure {
                tip: format!("block size {block_size} too small"),
            });
        }

        let file = self.file(handle)?;
        let length = if length == 0 {
            file.stat().await?.size.unwrap_or_default().saturating_sub(offset)
        } else {
            length
        };
        let block_size = if block_size == 0 {
            length
        } else {
            block_size as u64
        };

        let mut hash = MdWrapper::initialize(md)?;
        let mut digests = vec![];
        let mut done = 0;
        while done < length {
            let block = block_size.min(length - done);
            let mut read = 0;
            while read < block {
                let want = (block - read).min(MAX_REQUEST_SIZE as u64) as u32;
                let data = file.read(offset + done + read, want).await?;
                if data.is_empty() {
                    return Err(Error::SFtpFailure {
                        tip: "end of file inside the checked range".to_string(),
                    });
                }
                hash.update(&data)?;
                read += data.len() as u64;
            }
            digests.extend(hash.finalize()?);
            done += block;
        }

        let mut buffer = Buffer::new();
        buffer.put_one(EXT_CHECK_FILE);
        buffer.put_one(name);
        buffer.put_bytes(digests);
        Ok(Reply::Extended(buffer.into_vec()))
    }

    async fn close_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let OpenHandle::File(mut file) = handle {
                if let Err(err) = file.close().await {
                    tracing::debug!("closing leftover sftp handle: {err}");
                }
            }
        }
    }
}

/// Serves SFTP version 3 from a [`FilesystemInterface`]. Register it in
/// [`Config::subsystems`](crate::Config) under `sftp`.
///
/// Requests on one channel are answered in order.
pub struct SftpServer {
    fs: Arc<dyn FilesystemInterface>,
}

impl SftpServer {
    pub fn new(fs: Arc<dyn FilesystemInterface>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl SubsystemHandler for SftpServer {
    async fn start(&self, name: &str, channel: Channel) {
        tracing::debug!("sftp subsystem {name} on channel {}", channel.id());
        let mut session = ServerSession {
            channel: channel.clone(),
            fs: self.fs.clone(),
            handles: HashMap::new(),
            next_handle: 0,
        };
        self.fs.session_started().await;
        if let Err(err) = session.run().await {
            tracing::info!("sftp session ended with error: {err}");
        }
        session.close_all().await;
        self.fs.session_ended().await;
        let _ = channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_paths() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("a/./b/../c"), "/a/c");
        assert_eq!(normalize("/../../x//y/"), "/x/y");
    }

    #[test]
    fn requests_decode() {
        let mut buffer = Buffer::new();
        buffer.put_one(EXT_CHECK_FILE);
        buffer.put_one("hf1");
        buffer.put_one("sha256,md5");
        buffer.put_u64(0);
        buffer.put_u64(0);
        buffer.put_u32(512);
        let op = Op::parse(SSH_FXP_EXTENDED, &Buffer::from_slice(buffer.as_ref())).unwrap();
        match op {
            Op::CheckFile {
                handle,
                algorithms,
                block_size,
                ..
            } => {
                assert_eq!(handle, b"hf1");
                assert_eq!(algorithms, ["sha256", "md5"]);
                assert_eq!(block_size, 512);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut buffer = Buffer::new();
        buffer.put_one("only-one");
        assert!(Op::parse(SSH_FXP_RENAME, &Buffer::from_slice(buffer.as_ref())).is_none());
        assert!(matches!(
            Op::parse(99, &Buffer::from_slice(&[])),
            Some(Op::Unsupported(_))
        ));
    }

    #[test]
    fn replies_round_trip_through_the_client_parser() {
        let names = vec![FileInfo::new(
            "a.txt".to_string(),
            String::new(),
            Attributes::default().with_size(3),
        )];
        let framed = encode_reply(9, &Reply::Name(names));
        let (id, reply) = Reply::parse(&framed[4..]).unwrap();
        assert_eq!(id, 9);
        let names = reply.into_name().unwrap().unwrap();
        assert_eq!(names[0].filename, "a.txt");
        assert!(names[0].longname.ends_with(" a.txt"));

        let framed = encode_reply(
            2,
            &Reply::Status {
                status: Status::NoSuchFile,
                msg: "nope".into(),
            },
        );
        let (_, reply) = Reply::parse(&framed[4..]).unwrap();
        assert!(matches!(reply.into_status(), Err(Error::NoSuchFile { .. })));
    }
}
