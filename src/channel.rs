use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::{
    error::{Error, Result},
    msg::{ExitStatus, Request, Signal},
    pipe::BufferedPipe,
    ssh::{buffer::Buffer, common::code::*},
    {o_channel, MSender},
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    VINTR = 1,
    VQUIT = 2,
    VERASE = 3,
    VKILL = 4,
    VEOF = 5,
    VEOL = 6,
    VEOL2 = 7,
    VSTART = 8,
    VSTOP = 9,
    VSUSP = 10,
    VDSUSP = 11,
    VREPRINT = 12,
    VWERASE = 13,
    VLNEXT = 14,
    VFLUSH = 15,
    VSWTCH = 16,
    VSTATUS = 17,
    VDISCARD = 18,
    IGNPAR = 30,
    PARMRK = 31,
    INPCK = 32,
    ISTRIP = 33,
    INLCR = 34,
    IGNCR = 35,
    ICRNL = 36,
    IUCLC = 37,
    IXON = 38,
    IXANY = 39,
    IXOFF = 40,
    IMAXBEL = 41,
    ISIG = 50,
    ICANON = 51,
    XCASE = 52,
    ECHO = 53,
    ECHOE = 54,
    ECHOK = 55,
    ECHONL = 56,
    NOFLSH = 57,
    TOSTOP = 58,
    IEXTEN = 59,
    ECHOCTL = 60,
    ECHOKE = 61,
    PENDIN = 62,
    OPOST = 70,
    OLCUC = 71,
    ONLCR = 72,
    OCRNL = 73,
    ONOCR = 74,
    ONLRET = 75,
    CS7 = 90,
    CS8 = 91,
    PARENB = 92,
    PARODD = 93,
    #[allow(non_camel_case_types)]
    TTY_OP_ISPEED = 128,
    #[allow(non_camel_case_types)]
    TTY_OP_OSPEED = 129,
}

/// Encoded terminal modes string of a `pty-req`, ending with TTY_OP_END.
pub fn encode_terminal_modes(modes: &[(TerminalMode, u32)]) -> Vec<u8> {
    let mut buffer = Buffer::new();
    for (mode, value) in modes {
        buffer.put_u8(*mode as u8);
        buffer.put_u32(*value);
    }
    buffer.put_u8(0);
    buffer.into_vec()
}

/// Parsed `pty-req` parameters, as handed to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub columns: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct ChannelState {
    pub combine_stderr: bool,
    pub eof_sent: bool,
    pub eof_received: bool,
    pub closed: bool,
    consumed: u32,
    timeout: Option<Duration>,
}

#[derive(Default, Clone)]
struct ExitState {
    status: Option<ExitStatus>,
    closed: bool,
}

pub(crate) struct ChannelShared {
    pub(crate) id: u32,
    kind: String,
    session: MSender<Request>,
    pub(crate) stdout: BufferedPipe,
    pub(crate) stderr: BufferedPipe,
    state: Mutex<ChannelState>,
    /// The peer's window as last seen by the session task.
    pub(crate) out_window: AtomicU32,
    in_window: u32,
    exit: watch::Sender<ExitState>,
    request_lock: tokio::sync::Mutex<()>,
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        let _ = self.session.send(Request::ChannelClose {
            id: self.id,
            sender: None,
        });
    }
}

impl ChannelShared {
    pub(crate) fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Routes inbound data to a pipe, discarding unknown extended streams.
    pub(crate) fn receive(&self, ext: Option<u32>, data: &[u8]) {
        match ext {
            None => self.stdout.feed(data),
            Some(SSH_EXTENDED_DATA_STDERR) => {
                if self.state().combine_stderr {
                    self.stdout.feed(data)
                } else {
                    self.stderr.feed(data)
                }
            }
            Some(code) => {
                tracing::debug!(
                    "channel {}: dropped {} bytes of extended data type {code}",
                    self.id,
                    data.len()
                );
                self.consumed(data.len());
            }
        }
    }

    pub(crate) fn receive_eof(&self) {
        self.state().eof_received = true;
        self.stdout.close();
        self.stderr.close();
    }

    pub(crate) fn set_closed(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.eof_received = true;
        }
        self.stdout.close();
        self.stderr.close();
        self.exit.send_modify(|state| state.closed = true);
    }

    pub(crate) fn set_exit_status(&self, status: ExitStatus) {
        self.exit.send_modify(|state| state.status = Some(status));
    }

    fn consumed(&self, size: usize) {
        let count = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.consumed += size as u32;
            if state.consumed <= self.in_window / 10 {
                return;
            }
            std::mem::take(&mut state.consumed)
        };
        let _ = self.session.send(Request::ChannelWindowAdjust { id: self.id, count });
    }
}

/// One multiplexed stream of a session.
///
/// Handles are cheap clones. The channel is closed once the last handle is
/// dropped, or explicitly through [`Channel::close`].
#[derive(Clone)]
pub struct Channel(pub(crate) Arc<ChannelShared>);

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(id: u32, kind: impl Into<String>, session: MSender<Request>, in_window: u32) -> Self {
        let (exit, _) = watch::channel(ExitState::default());
        Self(Arc::new(ChannelShared {
            id,
            kind: kind.into(),
            session,
            stdout: BufferedPipe::new(),
            stderr: BufferedPipe::new(),
            state: Mutex::new(ChannelState::default()),
            out_window: AtomicU32::new(0),
            in_window,
            exit,
            request_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    fn send_request(&self, msg: Request) -> Result<()> {
        self.0.session.send(msg).map_err(|_| Error::Disconnected)
    }

    /// Queues a close without waiting for it.
    pub(crate) fn close_later(&self) {
        let _ = self.send_request(Request::ChannelClose {
            id: self.0.id,
            sender: None,
        });
    }

    /// Bounds every single read, write and request on this channel.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.0.state().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.0.state().timeout
    }

    async fn wait<T>(&self, recver: crate::OReceiver<Result<T>>) -> Result<T> {
        match self.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, recver).await??,
            None => recver.await?,
        }
    }

    /// Sends extended data of stderr into stdout from now on. Returns the
    /// previous setting.
    pub fn set_combine_stderr(&self, combine: bool) -> bool {
        let old = std::mem::replace(&mut self.0.state().combine_stderr, combine);
        if combine && !old {
            if let Some(data) = self.0.stderr.try_read(usize::MAX) {
                self.0.stdout.feed(&data);
            }
        }
        old
    }

    pub fn recv_ready(&self) -> bool {
        !self.0.stdout.is_empty()
    }

    pub fn recv_stderr_ready(&self) -> bool {
        !self.0.stderr.is_empty()
    }

    pub fn send_ready(&self) -> bool {
        let state = self.0.state();
        !state.closed && !state.eof_sent && self.0.out_window.load(Ordering::Acquire) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.0.state().closed
    }

    pub fn eof_received(&self) -> bool {
        self.0.state().eof_received
    }

    async fn read_pipe(&self, pipe: &BufferedPipe, size: usize) -> Result<Bytes> {
        let data = pipe.read(size, self.timeout()).await?;
        if !data.is_empty() {
            self.0.consumed(data.len());
        }
        Ok(data)
    }

    /// Reads up to `size` bytes of stdout, empty once the peer sent EOF.
    pub async fn read(&self, size: usize) -> Result<Vec<u8>> {
        Ok(self.read_pipe(&self.0.stdout, size).await?.to_vec())
    }

    pub async fn read_stderr(&self, size: usize) -> Result<Vec<u8>> {
        Ok(self.read_pipe(&self.0.stderr, size).await?.to_vec())
    }

    pub async fn read_exact(&self, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let data = self.read_pipe(&self.0.stdout, size - out.len()).await?;
            if data.is_empty() {
                return Err(Error::ChannelEof);
            }
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        loop {
            let data = self.read_pipe(&self.0.stdout, 32768).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&data);
        }
    }

    pub async fn read_stderr_to_end(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        loop {
            let data = self.read_pipe(&self.0.stderr, 32768).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&data);
        }
    }

    async fn write_ext(&self, ext: Option<u32>, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let (sender, recver) = o_channel();
        self.send_request(Request::ChannelData {
            id: self.0.id,
            ext,
            data: data.to_vec(),
            sender,
        })?;
        self.wait(recver).await
    }

    /// Sends as much of `data` as the peer's window allows, waiting while
    /// the window is empty. Returns the number of bytes sent.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_ext(None, data).await
    }

    pub async fn write_stderr(&self, data: &[u8]) -> Result<usize> {
        self.write_ext(Some(SSH_EXTENDED_DATA_STDERR), data).await
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let size = self.write(data).await?;
            data = &data[size..];
        }
        Ok(())
    }

    pub async fn write_stderr_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let size = self.write_stderr(data).await?;
            data = &data[size..];
        }
        Ok(())
    }

    /// No more data will be sent from this side.
    pub async fn send_eof(&self) -> Result<()> {
        let (sender, recver) = o_channel();
        self.send_request(Request::ChannelEof {
            id: self.0.id,
            sender,
        })?;
        self.wait(recver).await
    }

    pub async fn close(&self) -> Result<()> {
        let (sender, recver) = o_channel();
        self.send_request(Request::ChannelClose {
            id: self.0.id,
            sender: Some(sender),
        })?;
        self.wait(recver).await
    }

    /// Sends a channel request; with `want_reply` waits for the peer's
    /// answer. Only one request waits for a reply at a time.
    pub async fn request(&self, name: &str, data: Vec<u8>, want_reply: bool) -> Result<()> {
        if !want_reply {
            return self.send_request(Request::ChannelRequest {
                id: self.0.id,
                name: name.to_string(),
                data,
                sender: None,
            });
        }

        let _guard = self.0.request_lock.lock().await;
        let (sender, recver) = o_channel();
        self.send_request(Request::ChannelRequest {
            id: self.0.id,
            name: name.to_string(),
            data,
            sender: Some(sender),
        })?;
        self.wait(recver).await
    }

    pub async fn request_pty(
        &self,
        term: &str,
        columns: u32,
        rows: u32,
        width: u32,
        height: u32,
        modes: &[(TerminalMode, u32)],
    ) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_one(term);
        buffer.put_u32(columns);
        buffer.put_u32(rows);
        buffer.put_u32(width);
        buffer.put_u32(height);
        buffer.put_one(encode_terminal_modes(modes));
        self.request("pty-req", buffer.into_vec(), true).await
    }

    pub async fn resize_pty(&self, columns: u32, rows: u32, width: u32, height: u32) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_u32(columns);
        buffer.put_u32(rows);
        buffer.put_u32(width);
        buffer.put_u32(height);
        self.request("window-change", buffer.into_vec(), false).await
    }

    pub async fn invoke_shell(&self) -> Result<()> {
        self.request("shell", vec![], true).await
    }

    pub async fn exec(&self, command: &str) -> Result<()> {
        self.request("exec", Buffer::from_one(command).into_vec(), true)
            .await
    }

    pub async fn invoke_subsystem(&self, name: &str) -> Result<()> {
        self.request("subsystem", Buffer::from_one(name).into_vec(), true)
            .await
    }

    pub async fn set_env(&self, name: &str, value: impl AsRef<[u8]>) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_one(name);
        buffer.put_one(value);
        self.request("env", buffer.into_vec(), true).await
    }

    /// Asks for X11 forwarding. Without a cookie a random one is used, which
    /// is returned.
    pub async fn request_x11(
        &self,
        single_connection: bool,
        protocol: &str,
        cookie: Option<&str>,
        screen: u32,
    ) -> Result<String> {
        let cookie = match cookie {
            Some(cookie) => cookie.to_string(),
            None => {
                let mut raw = [0u8; 16];
                openssl::rand::rand_bytes(&mut raw)?;
                raw.iter().map(|b| format!("{b:02x}")).collect()
            }
        };
        let mut buffer = Buffer::new();
        buffer.put_bool(single_connection);
        buffer.put_one(protocol);
        buffer.put_one(&cookie);
        buffer.put_u32(screen);
        self.request("x11-req", buffer.into_vec(), true).await?;
        Ok(cookie)
    }

    pub async fn request_forward_agent(&self) -> Result<()> {
        self.request("auth-agent-req@openssh.com", vec![], true)
            .await
    }

    pub async fn send_signal(&self, signal: impl Into<Signal>) -> Result<()> {
        let signal: Signal = signal.into();
        self.request("signal", Buffer::from_one(&signal.0).into_vec(), false)
            .await
    }

    pub async fn send_exit_status(&self, status: u32) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_u32(status);
        self.request("exit-status", buffer.into_vec(), false).await
    }

    pub async fn send_exit_signal(
        &self,
        signal: impl Into<Signal>,
        core_dumped: bool,
        error_msg: &str,
    ) -> Result<()> {
        let signal: Signal = signal.into();
        let mut buffer = Buffer::new();
        buffer.put_one(&signal.0);
        buffer.put_bool(core_dumped);
        buffer.put_one(error_msg);
        buffer.put_one("");
        self.request("exit-signal", buffer.into_vec(), false).await
    }

    /// Tells the client whether it may do flow control with ^S/^Q.
    pub async fn send_xon_xoff(&self, client_can_do: bool) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_bool(client_can_do);
        self.request("xon-xoff", buffer.into_vec(), false).await
    }

    pub fn exit_status_ready(&self) -> bool {
        self.0.exit.borrow().status.is_some()
    }

    /// Waits for the exit status reported by the server.
    pub async fn exit_status(&self) -> Result<ExitStatus> {
        let mut recver = self.0.exit.subscribe();
        let wait = recver.wait_for(|state| state.status.is_some() || state.closed);
        let state = match self.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, wait).await?,
            None => wait.await,
        }
        .map_err(|_| Error::Disconnected)?
        .clone();
        state.status.ok_or(Error::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::m_channel;

    #[tokio::test]
    async fn window_adjust_after_a_tenth() {
        let (sender, mut recver) = m_channel();
        let channel = Channel::new(4, "session", sender, 1000);
        channel.0.receive(None, &[1u8; 300]);

        assert_eq!(channel.read(50).await.unwrap().len(), 50);
        assert_eq!(channel.read(50).await.unwrap().len(), 50);
        assert!(recver.try_recv().is_err());

        assert_eq!(channel.read(1).await.unwrap().len(), 1);
        match recver.try_recv().unwrap() {
            Request::ChannelWindowAdjust { id, count } => {
                assert_eq!(id, 4);
                assert_eq!(count, 101);
            }
            _ => panic!("expected a window adjust"),
        }
    }

    #[tokio::test]
    async fn stderr_routing() {
        let (sender, _recver) = m_channel();
        let channel = Channel::new(0, "session", sender, 65536);
        channel.0.receive(Some(SSH_EXTENDED_DATA_STDERR), b"err");
        channel.0.receive(Some(7), b"dropped");
        channel.0.receive(None, b"out");
        assert_eq!(channel.read(10).await.unwrap(), b"out");
        assert_eq!(channel.read_stderr(10).await.unwrap(), b"err");

        channel.0.receive(Some(SSH_EXTENDED_DATA_STDERR), b"early");
        assert!(!channel.set_combine_stderr(true));
        channel.0.receive(Some(SSH_EXTENDED_DATA_STDERR), b" late");
        assert_eq!(channel.read(20).await.unwrap(), b"early late");
        assert!(!channel.recv_stderr_ready());
    }

    #[tokio::test]
    async fn eof_drains_then_ends() {
        let (sender, _recver) = m_channel();
        let channel = Channel::new(0, "session", sender, 65536);
        channel.0.receive(None, b"tail");
        channel.0.receive_eof();
        assert!(channel.eof_received());
        assert_eq!(channel.read_to_end().await.unwrap(), b"tail");
        assert!(channel.read(10).await.unwrap().is_empty());
        assert!(matches!(channel.read_exact(1).await, Err(Error::ChannelEof)));
    }

    #[tokio::test]
    async fn exit_status_wakes_on_close() {
        let (sender, _recver) = m_channel();
        let channel = Channel::new(0, "session", sender, 65536);
        let waiter = channel.clone();
        let task = tokio::spawn(async move { waiter.exit_status().await });
        channel.0.set_exit_status(ExitStatus::Normal(3));
        assert_eq!(task.await.unwrap().unwrap(), ExitStatus::Normal(3));

        let other = Channel::new(1, "session", channel.0.session.clone(), 65536);
        other.0.set_closed();
        assert!(matches!(other.exit_status().await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn drop_closes() {
        let (sender, mut recver) = m_channel();
        let channel = Channel::new(9, "session", sender, 65536);
        let clone = channel.clone();
        drop(channel);
        assert!(recver.try_recv().is_err());
        drop(clone);
        assert!(matches!(
            recver.try_recv().unwrap(),
            Request::ChannelClose { id: 9, sender: None }
        ));
    }

    #[test]
    fn terminal_modes() {
        assert_eq!(
            encode_terminal_modes(&[(TerminalMode::ECHO, 1), (TerminalMode::TTY_OP_ISPEED, 38400)]),
            vec![53, 0, 0, 0, 1, 128, 0, 0, 0x96, 0, 0]
        );
    }
}
