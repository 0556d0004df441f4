use std::{
    collections::{BTreeMap, VecDeque},
    io::SeekFrom,
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    ssh::{buffer::Buffer, common::code::*},
    OReceiver,
};

use super::{client::ClientShared, Attributes, OpenFlags, Permissions, Reply, EXT_CHECK_FILE, MAX_REQUEST_SIZE};

/// Unanswered pipelined writes allowed before `write` waits for the oldest.
const MAX_PENDING_WRITES: usize = 64;

type ReplyReceiver = OReceiver<Result<Reply>>;

#[derive(Default)]
struct Prefetch {
    // offset -> (length asked for, reply)
    requests: BTreeMap<u64, (u32, ReplyReceiver)>,
    // offset -> bytes received
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl Prefetch {
    /// Bytes at `pos` already received, at most `size` of them. The block
    /// they came from is dropped, only its unread tail stays cached.
    fn take(&mut self, pos: u64, size: usize) -> Option<Vec<u8>> {
        let (&offset, chunk) = self.chunks.range(..=pos).next_back()?;
        let start = (pos - offset) as usize;
        if start >= chunk.len() {
            return None;
        }
        let mut data = self.chunks.remove(&offset)?.split_off(start);
        if data.len() > size {
            let tail = data.split_off(size);
            self.chunks.insert(pos + size as u64, tail);
        }
        Some(data)
    }

    /// The outstanding request whose range covers `pos`.
    fn pending_at(&self, pos: u64) -> Option<u64> {
        let (offset, (len, _)) = self.requests.range(..=pos).next_back()?;
        (pos < offset + *len as u64).then_some(*offset)
    }
}

/// An open remote file.
///
/// Reads and writes happen at the file position, which `seek` moves. With
/// [`set_pipelined`](Self::set_pipelined) writes don't wait for their status;
/// [`flush`](Self::flush) and [`close`](Self::close) collect them.
pub struct SftpFile {
    client: Arc<ClientShared>,
    handle: Vec<u8>,
    flags: OpenFlags,
    pos: u64,
    pipelined: bool,
    writes: VecDeque<ReplyReceiver>,
    prefetch: Prefetch,
    closed: bool,
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let body = Buffer::from_one(&self.handle).into_vec();
        runtime.spawn(async move {
            let _ = client.submit(SSH_FXP_CLOSE, &body).await;
        });
    }
}

impl SftpFile {
    pub(crate) fn new(client: Arc<ClientShared>, handle: Vec<u8>, flags: OpenFlags) -> Self {
        Self {
            client,
            handle,
            flags,
            pos: 0,
            pipelined: false,
            writes: VecDeque::new(),
            prefetch: Prefetch::default(),
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_argument("file is closed"));
        }
        Ok(())
    }

    fn handle_body(&self) -> Buffer {
        Buffer::from_one(&self.handle)
    }

    async fn submit_read(&self, offset: u64, len: u32) -> Result<ReplyReceiver> {
        let mut buffer = self.handle_body();
        buffer.put_u64(offset);
        buffer.put_u32(len);
        self.client.submit(SSH_FXP_READ, buffer.as_ref()).await
    }

    /// One READ at `offset`; empty at end of file.
    async fn read_once(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let recver = self.submit_read(offset, len).await?;
        Ok(ClientShared::wait(recver).await?.into_data()?.unwrap_or_default())
    }

    /// Reads `len` bytes at `offset`, fewer only at end of file.
    async fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        while (out.len() as u64) < len {
            let want = (len - out.len() as u64).min(MAX_REQUEST_SIZE as u64) as u32;
            let data = self.read_once(offset + out.len() as u64, want).await?;
            if data.is_empty() {
                break;
            }
            out.extend(data);
        }
        Ok(out)
    }

    /// Waits for the prefetch reply covering `pos`, if one is outstanding.
    async fn settle_prefetch(&mut self, pos: u64) -> Result<()> {
        let Some(offset) = self.prefetch.pending_at(pos) else {
            return Ok(());
        };
        let Some((_, recver)) = self.prefetch.requests.remove(&offset) else {
            return Ok(());
        };
        let data = ClientShared::wait(recver).await?.into_data()?;
        self.prefetch.chunks.insert(offset, data.unwrap_or_default());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn prefetched_bytes(&self) -> usize {
        self.prefetch.chunks.values().map(Vec::len).sum()
    }

    /// Reads `size` bytes at the current position, fewer only at end of
    /// file. Prefetched data is used first.
    pub async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut out = Vec::with_capacity(size.min(MAX_REQUEST_SIZE as usize));
        while out.len() < size {
            let want = (size - out.len()).min(MAX_REQUEST_SIZE as usize);
            self.settle_prefetch(self.pos).await?;
            let data = match self.prefetch.take(self.pos, want) {
                Some(data) => data,
                None => self.read_once(self.pos, want as u32).await?,
            };
            if data.is_empty() {
                break;
            }
            self.pos += data.len() as u64;
            out.extend(data);
        }
        Ok(out)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![];
        loop {
            let data = self.read(MAX_REQUEST_SIZE as usize).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend(data);
        }
    }

    /// Starts reading the rest of the file in the background, up to `size`
    /// (fetched with FSTAT when `None`). Later reads are served from the
    /// replies as they arrive.
    pub async fn prefetch(&mut self, size: Option<u64>) -> Result<()> {
        self.check_open()?;
        let size = match size {
            Some(size) => size,
            None => self.stat().await?.size.unwrap_or_default(),
        };
        let mut offset = self.pos;
        let mut count = 0;
        while offset < size {
            let len = (size - offset).min(MAX_REQUEST_SIZE as u64) as u32;
            let covered = self.prefetch.pending_at(offset).is_some()
                || self.prefetch.chunks.contains_key(&offset);
            if !covered {
                let recver = self.submit_read(offset, len).await?;
                self.prefetch.requests.insert(offset, (len, recver));
                count += 1;
            }
            offset += len as u64;
        }
        tracing::debug!("sftp prefetching {count} blocks up to {size}");
        Ok(())
    }

    /// Reads several ranges at once. The result follows the order of
    /// `chunks` whatever order the replies come back in.
    pub async fn readv(&mut self, chunks: &[(u64, u32)]) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        let mut requests = Vec::with_capacity(chunks.len());
        for &(offset, len) in chunks {
            let mut parts = vec![];
            let mut done = 0;
            while done < len {
                let part = (len - done).min(MAX_REQUEST_SIZE);
                let at = offset + done as u64;
                parts.push((at, part, self.submit_read(at, part).await?));
                done += part;
            }
            requests.push(parts);
        }

        let mut out = Vec::with_capacity(chunks.len());
        for parts in requests {
            let mut data = vec![];
            let mut eof = false;
            for (at, part, recver) in parts {
                let got = ClientShared::wait(recver).await?.into_data()?.unwrap_or_default();
                if eof {
                    continue;
                }
                let got_len = got.len() as u64;
                data.extend(got);
                if got_len == 0 {
                    eof = true;
                } else if got_len < part as u64 {
                    // servers may answer with less than asked
                    let rest = self.read_at(at + got_len, part as u64 - got_len).await?;
                    eof = (rest.len() as u64) < part as u64 - got_len;
                    data.extend(rest);
                }
            }
            out.push(data);
        }
        Ok(out)
    }

    /// Writes all of `data` at the current position.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.prefetch = Prefetch::default();
        for chunk in data.chunks(MAX_REQUEST_SIZE as usize) {
            let mut buffer = self.handle_body();
            buffer.put_u64(self.pos);
            buffer.put_one(chunk);
            let recver = self.client.submit(SSH_FXP_WRITE, buffer.as_ref()).await?;
            if self.pipelined {
                self.writes.push_back(recver);
                if self.writes.len() > MAX_PENDING_WRITES {
                    if let Some(oldest) = self.writes.pop_front() {
                        ClientShared::wait(oldest).await?.into_status()?;
                    }
                }
            } else {
                ClientShared::wait(recver).await?.into_status()?;
            }
            self.pos += chunk.len() as u64;
        }
        Ok(())
    }

    /// Waits for the status of every pipelined write.
    pub async fn flush(&mut self) -> Result<()> {
        let mut res = Ok(());
        while let Some(recver) = self.writes.pop_front() {
            let status = ClientShared::wait(recver).await.and_then(Reply::into_status);
            if res.is_ok() {
                res = status;
            }
        }
        res
    }

    pub fn set_pipelined(&mut self, pipelined: bool) {
        self.pipelined = pipelined;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new = match pos {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.stat().await?.size.unwrap_or_default();
                size.checked_add_signed(delta)
            }
        };
        self.pos = new.ok_or_else(|| Error::invalid_argument("seek before start of file"))?;
        Ok(self.pos)
    }

    pub async fn stat(&self) -> Result<Attributes> {
        self.check_open()?;
        self.client
            .request(SSH_FXP_FSTAT, self.handle_body().as_ref())
            .await?
            .into_attrs()
    }

    pub async fn setstat(&self, attrs: &Attributes) -> Result<()> {
        self.check_open()?;
        let mut buffer = self.handle_body();
        attrs.to_bytes(&mut buffer);
        self.client
            .request(SSH_FXP_FSETSTAT, buffer.as_ref())
            .await?
            .into_status()
    }

    pub async fn chmod(&self, mode: u32) -> Result<()> {
        self.setstat(&Attributes::default().with_permissions(Permissions::from_bits_retain(mode)))
            .await
    }

    pub async fn truncate(&self, size: u64) -> Result<()> {
        self.setstat(&Attributes::default().with_size(size)).await
    }

    /// Server side hash of a range through the `check-file` extension.
    /// `length` 0 means up to the end, `block_size` 0 one hash for the whole
    /// range. Returns the concatenated digests.
    pub async fn check(
        &self,
        algorithms: &[&str],
        offset: u64,
        length: u64,
        block_size: u32,
    ) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut buffer = Buffer::new();
        buffer.put_one(EXT_CHECK_FILE);
        buffer.put_one(&self.handle);
        buffer.put_one(algorithms.join(","));
        buffer.put_u64(offset);
        buffer.put_u64(length);
        buffer.put_u32(block_size);
        let reply = self
            .client
            .request(SSH_FXP_EXTENDED, buffer.as_ref())
            .await?
            .into_extended()?;

        // extension name, algorithm, digests
        let reply = Buffer::from_slice(&reply);
        let (Some(_), Some(algorithm)) = (reply.take_str(), reply.take_string()) else {
            return Err(Error::BadMessage {
                tip: "malformed check-file reply".to_string(),
            });
        };
        tracing::trace!("check-file answered with {algorithm}");
        Ok(reply.remaining().to_vec())
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Collects pipelined writes and closes the handle.
    pub async fn close(mut self) -> Result<()> {
        let flushed = self.flush().await;
        self.prefetch = Prefetch::default();
        self.closed = true;
        let closed = self
            .client
            .request(SSH_FXP_CLOSE, self.handle_body().as_ref())
            .await
            .and_then(Reply::into_status);
        flushed.and(closed)
    }
}
