use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    channel::Channel,
    error::{Error, Result},
    ssh::{
        buffer::Buffer,
        common::{code::*, SFTP_VERSION},
    },
    o_channel, OReceiver, OSender,
};

use super::{
    file::SftpFile, packet, read_packet, Attributes, FileInfo, OpenFlags, Permissions, Reply,
    EXT_POSIX_RENAME,
};

type Waiter = OSender<Result<Reply>>;

#[derive(Default)]
struct Pending {
    next_id: u32,
    waiters: HashMap<u32, Waiter>,
    // set once the reader stopped
    error: Option<Error>,
}

/// State shared by an [`SftpClient`], its open files and the reader task.
pub(crate) struct ClientShared {
    channel: Channel,
    pending: Mutex<Pending>,
    // keeps each request's bytes contiguous on the channel
    write_lock: tokio::sync::Mutex<()>,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.channel.close_later();
    }
}

impl ClientShared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends one request and returns where its reply will arrive.
    pub(crate) async fn submit(&self, code: u8, body: &[u8]) -> Result<OReceiver<Result<Reply>>> {
        let (sender, recver) = o_channel();
        let _guard = self.write_lock.lock().await;

        let id = {
            let mut pending = self.pending();
            if let Some(err) = &pending.error {
                return Err(err.clone());
            }
            pending.next_id = pending.next_id.wrapping_add(1);
            let id = pending.next_id;
            pending.waiters.insert(id, sender);
            id
        };

        let mut buffer = Buffer::with_capacity(body.len() + 4);
        buffer.put_u32(id);
        buffer.put_bytes(body);
        tracing::trace!("sftp request {id}: type {code}");
        if let Err(err) = self.channel.write_all(&packet(code, buffer.as_ref())).await {
            self.pending().waiters.remove(&id);
            return Err(err);
        }
        Ok(recver)
    }

    pub(crate) async fn wait(recver: OReceiver<Result<Reply>>) -> Result<Reply> {
        recver.await.map_err(|_| Error::ConnectionLost {
            tip: "sftp session ended".to_string(),
        })?
    }

    pub(crate) async fn request(&self, code: u8, body: &[u8]) -> Result<Reply> {
        let recver = self.submit(code, body).await?;
        Self::wait(recver).await
    }

    fn dispatch(&self, id: u32, reply: Reply) {
        let waiter = self.pending().waiters.remove(&id);
        match waiter {
            // a dropped receiver is a prefetch nobody wants anymore
            Some(waiter) => drop(waiter.send(Ok(reply))),
            None => tracing::debug!("sftp reply for unknown request {id}: {reply:?}"),
        }
    }

    fn fail(&self, err: Error) {
        let waiters = {
            let mut pending = self.pending();
            pending.error = Some(err.clone());
            std::mem::take(&mut pending.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

async fn read_loop(channel: Channel, shared: Weak<ClientShared>) {
    let err = loop {
        let packet = match read_packet(&channel).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                break Error::ConnectionLost {
                    tip: "sftp channel closed".to_string(),
                }
            }
            Err(err) => break err,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match Reply::parse(&packet) {
            Some((id, reply)) => shared.dispatch(id, reply),
            None => {
                break Error::BadMessage {
                    tip: format!("malformed sftp reply of type {:?}", packet.first()),
                }
            }
        }
    };
    tracing::debug!("sftp reader stopped: {err}");
    if let Some(shared) = shared.upgrade() {
        shared.fail(err);
    }
}

fn path_body(path: &str) -> Vec<u8> {
    Buffer::from_one(path).into_vec()
}

fn first_name(reply: Reply) -> Result<String> {
    reply
        .into_name()?
        .and_then(|names| names.into_iter().next())
        .map(|info| info.filename)
        .ok_or_else(|| Error::BadMessage {
            tip: "empty NAME reply".to_string(),
        })
}

/// SFTP client on one session channel.
///
/// Requests may be issued from several tasks at once; a background task
/// routes each reply to its request by id. Relative paths resolve against
/// the directory set with [`SftpClient::chdir`].
pub struct SftpClient {
    shared: Arc<ClientShared>,
    version: u32,
    extensions: HashMap<String, Vec<u8>>,
    cwd: Mutex<Option<String>>,
}

impl SftpClient {
    /// Runs the version handshake on a channel whose `sftp` subsystem is
    /// already started.
    pub async fn new(channel: Channel) -> Result<Self> {
        channel
            .write_all(&packet(SSH_FXP_INIT, &SFTP_VERSION.to_be_bytes()))
            .await?;
        let reply = read_packet(&channel).await?.ok_or_else(|| Error::ConnectionLost {
            tip: "sftp channel closed before VERSION".to_string(),
        })?;

        let buffer = Buffer::from_slice(&reply);
        if buffer.take_u8() != Some(SSH_FXP_VERSION) {
            return Err(Error::BadMessage {
                tip: "expected a VERSION packet".to_string(),
            });
        }
        let version = buffer.take_u32().ok_or_else(|| Error::BadMessage {
            tip: "truncated VERSION packet".to_string(),
        })?;
        if version != SFTP_VERSION {
            tracing::info!("sftp server speaks version {version}");
        }
        let mut extensions = HashMap::new();
        while let (Some(name), Some((_, data))) = (buffer.take_string(), buffer.take_one()) {
            extensions.insert(name, data.to_vec());
        }
        tracing::debug!("sftp extensions: {:?}", extensions.keys());

        let shared = Arc::new(ClientShared {
            channel: channel.clone(),
            pending: Mutex::new(Pending::default()),
            write_lock: tokio::sync::Mutex::new(()),
        });
        tokio::spawn(read_loop(channel, Arc::downgrade(&shared)));

        Ok(Self {
            shared,
            version,
            extensions,
            cwd: Mutex::new(None),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extension data the server announced in VERSION.
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.extensions.get(name).map(|v| v.as_slice())
    }

    fn cwd_lock(&self) -> MutexGuard<'_, Option<String>> {
        self.cwd.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn adjust_path(&self, path: &str) -> String {
        match self.cwd_lock().as_deref() {
            Some(cwd) if !path.starts_with('/') => {
                if cwd.ends_with('/') {
                    format!("{cwd}{path}")
                } else {
                    format!("{cwd}/{path}")
                }
            }
            _ => path.to_string(),
        }
    }

    async fn path_request(&self, code: u8, path: &str) -> Result<Reply> {
        let path = self.adjust_path(path);
        self.shared.request(code, &path_body(&path)).await
    }

    /// Opens a remote file.
    pub async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        permissions: Option<Permissions>,
    ) -> Result<SftpFile> {
        let path = self.adjust_path(path);
        let mut buffer = Buffer::new();
        buffer.put_one(&path);
        buffer.put_u32(flags.bits());
        let attrs = Attributes {
            permissions,
            ..Default::default()
        };
        attrs.to_bytes(&mut buffer);

        let handle = self
            .shared
            .request(SSH_FXP_OPEN, buffer.as_ref())
            .await?
            .into_handle()?;
        tracing::debug!("sftp opened {path}");
        Ok(SftpFile::new(self.shared.clone(), handle, flags))
    }

    /// Opens a remote file with an fopen style mode such as `"r"` or `"w"`.
    pub async fn file(&self, path: &str, mode: &str) -> Result<SftpFile> {
        self.open(path, OpenFlags::from_mode(mode)?, None).await
    }

    async fn opendir(&self, path: &str) -> Result<Vec<u8>> {
        self.path_request(SSH_FXP_OPENDIR, path).await?.into_handle()
    }

    async fn close_handle(&self, handle: &[u8]) -> Result<()> {
        self.shared
            .request(SSH_FXP_CLOSE, &Buffer::from_one(handle).into_vec())
            .await?
            .into_status()
    }

    /// Entries of a directory with their attributes, without `.` and `..`.
    pub async fn listdir_attr(&self, path: &str) -> Result<Vec<FileInfo>> {
        let handle = self.opendir(path).await?;
        let body = Buffer::from_one(&handle).into_vec();
        let mut entries = vec![];
        let res = loop {
            let reply = match self.shared.request(SSH_FXP_READDIR, &body).await {
                Ok(reply) => reply,
                Err(err) => break Err(err),
            };
            match reply.into_name() {
                Ok(Some(names)) => entries.extend(
                    names
                        .into_iter()
                        .filter(|info| info.filename != "." && info.filename != ".."),
                ),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let closed = self.close_handle(&handle).await;
        res.and(closed)?;
        Ok(entries)
    }

    pub async fn listdir(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .listdir_attr(path)
            .await?
            .into_iter()
            .map(|info| info.filename)
            .collect())
    }

    pub async fn stat(&self, path: &str) -> Result<Attributes> {
        self.path_request(SSH_FXP_STAT, path).await?.into_attrs()
    }

    /// Like [`stat`](Self::stat) without following symbolic links.
    pub async fn lstat(&self, path: &str) -> Result<Attributes> {
        self.path_request(SSH_FXP_LSTAT, path).await?.into_attrs()
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.path_request(SSH_FXP_REMOVE, path).await?.into_status()
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_one(self.adjust_path(old));
        buffer.put_one(self.adjust_path(new));
        self.shared
            .request(SSH_FXP_RENAME, buffer.as_ref())
            .await?
            .into_status()
    }

    /// Rename that replaces an existing target.
    pub async fn posix_rename(&self, old: &str, new: &str) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_one(EXT_POSIX_RENAME);
        buffer.put_one(self.adjust_path(old));
        buffer.put_one(self.adjust_path(new));
        self.shared
            .request(SSH_FXP_EXTENDED, buffer.as_ref())
            .await?
            .into_status()
    }

    pub async fn mkdir(&self, path: &str, permissions: Permissions) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_one(self.adjust_path(path));
        Attributes::default()
            .with_permissions(permissions)
            .to_bytes(&mut buffer);
        self.shared
            .request(SSH_FXP_MKDIR, buffer.as_ref())
            .await?
            .into_status()
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        self.path_request(SSH_FXP_RMDIR, path).await?.into_status()
    }

    /// Creates `link` pointing at `target`.
    pub async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let mut buffer = Buffer::new();
        // OpenSSH order: target first
        buffer.put_one(target);
        buffer.put_one(self.adjust_path(link));
        self.shared
            .request(SSH_FXP_SYMLINK, buffer.as_ref())
            .await?
            .into_status()
    }

    pub async fn readlink(&self, path: &str) -> Result<String> {
        first_name(self.path_request(SSH_FXP_READLINK, path).await?)
    }

    pub async fn setstat(&self, path: &str, attrs: &Attributes) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_one(self.adjust_path(path));
        attrs.to_bytes(&mut buffer);
        self.shared
            .request(SSH_FXP_SETSTAT, buffer.as_ref())
            .await?
            .into_status()
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let attrs = Attributes::default().with_permissions(Permissions::from_bits_retain(mode));
        self.setstat(path, &attrs).await
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.setstat(path, &Attributes::default().with_user(uid, gid))
            .await
    }

    /// Sets access and modification time; `None` means now.
    pub async fn utime(&self, path: &str, times: Option<(u32, u32)>) -> Result<()> {
        let (atime, mtime) = times.unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or_default();
            (now, now)
        });
        self.setstat(path, &Attributes::default().with_time(atime, mtime))
            .await
    }

    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.setstat(path, &Attributes::default().with_size(size))
            .await
    }

    /// The server's canonical absolute form of `path`.
    pub async fn normalize(&self, path: &str) -> Result<String> {
        first_name(self.path_request(SSH_FXP_REALPATH, path).await?)
    }

    /// Changes the directory relative paths resolve against; `None` resets
    /// to the server's default.
    pub async fn chdir(&self, path: Option<&str>) -> Result<()> {
        let Some(path) = path else {
            *self.cwd_lock() = None;
            return Ok(());
        };
        if !self.stat(path).await?.is_dir() {
            return Err(Error::SFtpFailure {
                tip: format!("{path} is not a directory"),
            });
        }
        let cwd = self.normalize(path).await?;
        *self.cwd_lock() = Some(cwd);
        Ok(())
    }

    pub fn getcwd(&self) -> Option<String> {
        self.cwd_lock().clone()
    }

    /// Uploads `data` to `path`, returning the attributes of the result.
    pub async fn put_bytes(&self, data: &[u8], path: &str) -> Result<Attributes> {
        let mut file = self
            .open(path, OpenFlags::from_mode("w")?, None)
            .await?;
        file.set_pipelined(true);
        let res = file.write(data).await;
        let closed = file.close().await;
        res.and(closed)?;

        let attrs = self.stat(path).await?;
        if let Some(size) = attrs.size {
            if size != data.len() as u64 {
                return Err(Error::SFtpFailure {
                    tip: format!("size mismatch in put: {size} != {}", data.len()),
                });
            }
        }
        Ok(attrs)
    }

    pub async fn put(&self, local: impl AsRef<Path>, path: &str) -> Result<Attributes> {
        let data = tokio::fs::read(local).await?;
        self.put_bytes(&data, path).await
    }

    /// Downloads `path` with read-ahead.
    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, OpenFlags::READ, None).await?;
        let size = file.stat().await?.size;
        file.prefetch(size).await?;
        let res = file.read_to_end().await;
        let closed = file.close().await;
        let data = res?;
        closed?;

        if let Some(size) = size {
            if size != data.len() as u64 {
                return Err(Error::SFtpFailure {
                    tip: format!("size mismatch in get: {} != {size}", data.len()),
                });
            }
        }
        Ok(data)
    }

    pub async fn get(&self, path: &str, local: impl AsRef<Path>) -> Result<u64> {
        let data = self.get_bytes(path).await?;
        tokio::fs::write(local, &data).await?;
        Ok(data.len() as u64)
    }

    /// Closes the channel. Open files fail from now on.
    pub async fn close(self) -> Result<()> {
        self.shared.channel.close().await
    }
}
