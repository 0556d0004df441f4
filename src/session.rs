use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, Weak,
    },
    time::Duration,
};

use indexmap::IndexMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{sleep_until, Instant},
};

use crate::{
    auth::{self, InteractiveHandler, ServerAuth, ServerAuthStep},
    channel::{Channel, ChannelShared, PtyRequest},
    cipher::kex::{KexContext, KexOutput, KexStep, KeyExchange},
    error::{Error, Result},
    handshake::{self, Config, KeyMaterial, Methods, Negotiated, Role},
    keys::{decode_public_key, PrivateKey, PublicKey},
    m_channel,
    msg::{ChannelOpenFailureReson, DisconnectReson, ExitStatus, Message, Request, Signal},
    o_channel,
    server::{ServerInterface, SubsystemHandler},
    sftp::SftpClient,
    ssh::{
        buffer::Buffer,
        common::{code::*, *},
        stream::{BufferReader, InboundKeys, PacketReader, PacketWriter},
    },
    MReceiver, MSender, OSender,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What handles may read without asking the session task.
struct SessionState {
    role: Role,
    active: AtomicBool,
    authed: Arc<AtomicBool>,
    error: Mutex<Option<Error>>,
    session_id: OnceLock<Vec<u8>>,
    kex_count: AtomicU32,
    remote_version: String,
    host_key: Mutex<Option<Vec<u8>>>,
    username: Mutex<Option<String>>,
    banner: Mutex<Option<String>>,
}

/// An SSH-2 connection, client or server side.
///
/// All protocol work happens on a background task; this handle and every
/// [`Channel`] talk to it through a queue. Dropping the handle disconnects.
pub struct Session {
    sender: MSender<Request>,
    state: Arc<SessionState>,
    accept: tokio::sync::Mutex<MReceiver<Channel>>,
    auth_timeout: Duration,
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.sender.send(Request::Disconnect {
            reason: DisconnectReson::BY_APPLICATION,
            desc: "bye".to_string(),
        });
    }
}

impl Session {
    /// Runs the client handshake up to the end of the first key exchange.
    pub async fn connect<S>(config: Config, socket: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(config, socket, Role::Client, None).await
    }

    /// Runs the server handshake up to the end of the first key exchange.
    /// Authentication and channels are then driven by `server`.
    pub async fn accept<S>(config: Config, socket: S, server: Arc<dyn ServerInterface>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(config, socket, Role::Server, Some(server)).await
    }

    async fn start<S>(
        config: Config,
        socket: S,
        role: Role,
        server: Option<Arc<dyn ServerInterface>>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate(role)?;

        let (read_half, write_half) = tokio::io::split(socket);
        let authed = Arc::new(AtomicBool::new(false));
        let limits = config.rekey_limits();
        let mut writer = PacketWriter::new(write_half, limits, authed.clone());
        let mut reader = BufferReader::new(read_half);

        let (ours, theirs) = tokio::time::timeout(
            config.banner_timeout,
            handshake::banner_exchange(&mut reader, &mut writer, &config.client_id),
        )
        .await??;

        let (client_version, server_version) = match role {
            Role::Client => (ours, theirs.clone()),
            Role::Server => (theirs.clone(), ours),
        };

        let state = Arc::new(SessionState {
            role,
            active: AtomicBool::new(true),
            authed: authed.clone(),
            error: Mutex::new(None),
            session_id: OnceLock::new(),
            kex_count: AtomicU32::new(0),
            remote_version: String::from_utf8_lossy(&theirs).to_string(),
            host_key: Mutex::new(None),
            username: Mutex::new(None),
            banner: Mutex::new(None),
        });

        let (sender, requests) = m_channel();
        let (event_sender, events) = m_channel();
        let (keys, keys_recver) = m_channel();
        let (accept_sender, accept) = m_channel();

        let reader = PacketReader::new(reader, limits, authed.clone());
        tokio::spawn(read_loop(reader, event_sender, keys_recver, authed, role));

        let (kex_sender, kex_recver) = o_channel();
        let auth_timeout = config.auth_timeout;
        let inner = SessionInner {
            role,
            writer,
            requests,
            sender: sender.clone(),
            events,
            keys,
            state: state.clone(),
            server,
            client_version,
            server_version,
            kex: KexState::default(),
            deferred: VecDeque::new(),
            kex_waiters: vec![kex_sender],
            rekey_wanted: false,
            keepalive: config.keepalive_interval,
            service_requested: false,
            service_accepted: false,
            pending_auth: None,
            server_auth: ServerAuth::default(),
            channels: HashMap::new(),
            next_channel: 0,
            pending_opens: HashMap::new(),
            global_replies: VecDeque::new(),
            forwards: vec![],
            x11_requested: false,
            accept: accept_sender,
            disconnect_sent: false,
            config,
        };
        tokio::spawn(inner.run());

        let session = Self {
            sender,
            state,
            accept: tokio::sync::Mutex::new(accept),
            auth_timeout,
        };
        kex_recver.await??;
        Ok(session)
    }

    fn send_request(&self, msg: Request) -> Result<()> {
        self.sender.send(msg).map_err(|_| self.error())
    }

    fn error(&self) -> Error {
        lock(&self.state.error)
            .clone()
            .unwrap_or(Error::Disconnected)
    }

    async fn wait<T>(&self, recver: crate::OReceiver<Result<T>>) -> Result<T> {
        match recver.await {
            Ok(res) => res,
            Err(_) => Err(self.error()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_active() && self.state.authed.load(Ordering::Acquire)
    }

    /// The error that ended the session, if it ended that way.
    pub fn last_error(&self) -> Option<Error> {
        lock(&self.state.error).clone()
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn username(&self) -> Option<String> {
        lock(&self.state.username).clone()
    }

    /// The exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.state.session_id.get().cloned()
    }

    /// Completed key exchanges, the initial one included.
    pub fn kex_count(&self) -> u32 {
        self.state.kex_count.load(Ordering::Acquire)
    }

    pub fn remote_version(&self) -> &str {
        &self.state.remote_version
    }

    /// Client side: the key the server proved it owns.
    pub fn remote_host_key(&self) -> Option<Box<dyn PublicKey>> {
        let blob = lock(&self.state.host_key).clone()?;
        decode_public_key(&blob).ok()
    }

    pub fn auth_banner(&self) -> Option<String> {
        lock(&self.state.banner).clone()
    }

    async fn userauth(
        &self,
        username: &str,
        method: &str,
        payload: Vec<u8>,
        handler: Option<InteractiveHandler>,
    ) -> Result<Vec<String>> {
        let (sender, recver) = o_channel();
        self.send_request(Request::Userauth {
            username: username.to_string(),
            method: method.to_string(),
            payload,
            handler,
            sender,
        })?;
        tokio::time::timeout(self.auth_timeout, self.wait(recver)).await?
    }

    /// Returns the methods still required; empty once fully authenticated.
    pub async fn auth_none(&self, username: &str) -> Result<Vec<String>> {
        self.userauth(username, "none", auth::none_request(username), None)
            .await
    }

    pub async fn auth_password(&self, username: &str, password: &str) -> Result<Vec<String>> {
        self.userauth(
            username,
            "password",
            auth::password_request(username, password),
            None,
        )
        .await
    }

    pub async fn auth_publickey(&self, username: &str, key: &dyn PrivateKey) -> Result<Vec<String>> {
        let session_id = self
            .session_id()
            .ok_or_else(|| Error::ub("no key exchange finished yet"))?;
        let payload = auth::publickey_request(&session_id, username, key)?;
        self.userauth(username, "publickey", payload, None).await
    }

    /// `handler` gets `(title, instructions, prompts)` for every round of
    /// questions the server asks.
    pub async fn auth_interactive<F>(&self, username: &str, handler: F, submethods: &str) -> Result<Vec<String>>
    where
        F: FnMut(&str, &str, &[(String, bool)]) -> Vec<String> + Send + 'static,
    {
        self.userauth(
            username,
            "keyboard-interactive",
            auth::interactive_request(username, submethods),
            Some(Box::new(handler)),
        )
        .await
    }

    /// Forces a key exchange and waits until it is done.
    pub async fn renegotiate_keys(&self) -> Result<()> {
        let (sender, recver) = o_channel();
        self.send_request(Request::Renegotiate { sender })?;
        self.wait(recver).await
    }

    pub fn send_ignore(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_request(Request::Ignore { data: data.into() })
    }

    /// Sends `keepalive@lag.net` whenever nothing was written for `interval`.
    pub fn set_keepalive(&self, interval: Option<Duration>) -> Result<()> {
        self.send_request(Request::SetKeepalive(interval))
    }

    /// With `want_reply`, waits for the answer: `Some(data)` on success,
    /// `None` on failure.
    pub async fn global_request(
        &self,
        name: &str,
        data: impl Into<Vec<u8>>,
        want_reply: bool,
    ) -> Result<Option<Vec<u8>>> {
        if !want_reply {
            self.send_request(Request::GlobalRequest {
                name: name.to_string(),
                data: data.into(),
                sender: None,
            })?;
            return Ok(None);
        }
        let (sender, recver) = o_channel();
        self.send_request(Request::GlobalRequest {
            name: name.to_string(),
            data: data.into(),
            sender: Some(sender),
        })?;
        self.wait(recver).await
    }

    /// Asks the server to listen on `address:port`. Returns the bound port,
    /// which differs from `port` when it is 0.
    pub async fn request_port_forward(&self, address: &str, port: u32) -> Result<u32> {
        let (sender, recver) = o_channel();
        self.send_request(Request::PortForward {
            address: address.to_string(),
            port,
            sender,
        })?;
        self.wait(recver).await
    }

    pub async fn cancel_port_forward(&self, address: &str, port: u32) -> Result<()> {
        let (sender, recver) = o_channel();
        self.send_request(Request::CancelPortForward {
            address: address.to_string(),
            port,
            sender,
        })?;
        self.wait(recver).await
    }

    pub async fn open_channel(&self, kind: &str, extra: impl Into<Vec<u8>>) -> Result<Channel> {
        let (sender, recver) = o_channel();
        self.send_request(Request::ChannelOpen {
            kind: kind.to_string(),
            extra: extra.into(),
            sender,
        })?;
        self.wait(recver).await
    }

    pub async fn open_session(&self) -> Result<Channel> {
        self.open_channel("session", vec![]).await
    }

    pub async fn open_direct_tcpip(&self, dest: (&str, u32), origin: (&str, u32)) -> Result<Channel> {
        let mut buffer = Buffer::new();
        buffer.put_one(dest.0);
        buffer.put_u32(dest.1);
        buffer.put_one(origin.0);
        buffer.put_u32(origin.1);
        self.open_channel("direct-tcpip", buffer.into_vec()).await
    }

    /// Server side: hands a connection on a forwarded port to the client.
    pub async fn open_forwarded_tcpip(
        &self,
        connected: (&str, u32),
        origin: (&str, u32),
    ) -> Result<Channel> {
        let mut buffer = Buffer::new();
        buffer.put_one(connected.0);
        buffer.put_u32(connected.1);
        buffer.put_one(origin.0);
        buffer.put_u32(origin.1);
        self.open_channel("forwarded-tcpip", buffer.into_vec())
            .await
    }

    /// Server side: hands an X11 connection to the client.
    pub async fn open_x11(&self, origin: (&str, u32)) -> Result<Channel> {
        let mut buffer = Buffer::new();
        buffer.put_one(origin.0);
        buffer.put_u32(origin.1);
        self.open_channel("x11", buffer.into_vec()).await
    }

    /// Next channel the peer opened and we accepted. Fails with
    /// [`Error::Timeout`] when none arrives in time.
    pub async fn accept_channel(&self, timeout: Option<Duration>) -> Result<Channel> {
        let mut accept = self.accept.lock().await;
        let channel = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, accept.recv()).await?,
            None => accept.recv().await,
        };
        channel.ok_or_else(|| self.error())
    }

    /// Opens a session channel running the `sftp` subsystem.
    pub async fn open_sftp(&self) -> Result<SftpClient> {
        let channel = self.open_session().await?;
        channel.invoke_subsystem("sftp").await?;
        SftpClient::new(channel).await
    }

    pub async fn disconnect(self) -> Result<()> {
        self.send_request(Request::Disconnect {
            reason: DisconnectReson::BY_APPLICATION,
            desc: "bye".to_string(),
        })
    }
}

enum ReaderEvent {
    Packet { sequence: u32, payload: Vec<u8> },
    NeedRekey,
    Error(Error),
}

async fn read_loop<R>(
    mut reader: PacketReader<R>,
    events: MSender<ReaderEvent>,
    mut keys: MReceiver<InboundKeys>,
    authed: Arc<AtomicBool>,
    role: Role,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let (sequence, payload) = match reader.recv().await {
            Ok(packet) => packet,
            Err(err) => {
                let _ = events.send(ReaderEvent::Error(err));
                return;
            }
        };
        if reader.take_rekey_request() {
            tracing::debug!("inbound rekey threshold reached");
            let _ = events.send(ReaderEvent::NeedRekey);
        }

        let code = payload.first().copied();
        // compression may switch on with the very next packet
        if role == Role::Client && code == Some(SSH_MSG_USERAUTH_SUCCESS) {
            authed.store(true, Ordering::Release);
        }
        if events
            .send(ReaderEvent::Packet { sequence, payload })
            .is_err()
        {
            return;
        }
        if code == Some(SSH_MSG_NEWKEYS) {
            match keys.recv().await {
                Some(keys) => reader.install(keys),
                None => return,
            }
        }
    }
}

#[derive(Default)]
struct KexState {
    ours: Option<Vec<u8>>,
    theirs: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    engine: Option<Box<dyn KeyExchange + Send>>,
    skip_guess: bool,
    newkeys_sent: bool,
    newkeys_received: bool,
    deadline: Option<Instant>,
}

impl KexState {
    fn active(&self) -> bool {
        self.ours.is_some() || self.theirs.is_some()
    }

    // user traffic waits from our KEXINIT until our NEWKEYS
    fn gate_closed(&self) -> bool {
        self.ours.is_some() && !self.newkeys_sent
    }
}

struct PendingAuth {
    method: String,
    username: String,
    payload: Option<Vec<u8>>,
    handler: Option<InteractiveHandler>,
    sender: OSender<Result<Vec<String>>>,
}

struct PendingWrite {
    ext: Option<u32>,
    data: Vec<u8>,
    sender: OSender<Result<usize>>,
}

struct ChannelEntry {
    handle: Weak<ChannelShared>,
    remote_id: u32,
    remote_window: u32,
    remote_max: u32,
    local_window: u32,
    eof_sent: bool,
    close_sent: bool,
    close_received: bool,
    writes: VecDeque<PendingWrite>,
    eof_waiters: Vec<OSender<Result<()>>>,
    requests: VecDeque<OSender<Result<()>>>,
}

impl ChannelEntry {
    fn handle(&self) -> Option<Channel> {
        self.handle.upgrade().map(Channel)
    }

    fn fail(&mut self, err: &Error) {
        if let Some(handle) = self.handle.upgrade() {
            handle.set_closed();
        }
        for write in self.writes.drain(..) {
            let _ = write.sender.send(Err(err.clone()));
        }
        for sender in self.eof_waiters.drain(..) {
            let _ = sender.send(Err(err.clone()));
        }
        for sender in self.requests.drain(..) {
            let _ = sender.send(Err(err.clone()));
        }
    }
}

enum GlobalReply {
    Raw(OSender<Result<Option<Vec<u8>>>>),
    Forward {
        address: String,
        port: u32,
        sender: OSender<Result<u32>>,
    },
    Cancel {
        address: String,
        port: u32,
        sender: OSender<Result<()>>,
    },
}

struct SessionInner<W> {
    config: Config,
    role: Role,
    writer: PacketWriter<W>,
    requests: MReceiver<Request>,
    sender: MSender<Request>,
    events: MReceiver<ReaderEvent>,
    keys: MSender<InboundKeys>,
    state: Arc<SessionState>,
    server: Option<Arc<dyn ServerInterface>>,

    client_version: Vec<u8>,
    server_version: Vec<u8>,
    kex: KexState,
    deferred: VecDeque<Vec<u8>>,
    kex_waiters: Vec<OSender<Result<()>>>,
    rekey_wanted: bool,
    keepalive: Option<Duration>,

    service_requested: bool,
    service_accepted: bool,
    pending_auth: Option<PendingAuth>,
    server_auth: ServerAuth,

    channels: HashMap<u32, ChannelEntry>,
    next_channel: u32,
    pending_opens: HashMap<u32, (String, OSender<Result<Channel>>)>,
    global_replies: VecDeque<GlobalReply>,
    forwards: Vec<(String, u32)>,
    x11_requested: bool,
    accept: MSender<Channel>,
    disconnect_sent: bool,
}

impl<W> SessionInner<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let err = match self.start_kex().await {
            Err(err) => err,
            Ok(()) => loop {
                let deadline = self.kex.deadline;
                let keepalive = match (self.keepalive, self.kex.active()) {
                    (Some(interval), false) => {
                        Some(Instant::from_std(self.writer.idle_since()) + interval)
                    }
                    _ => None,
                };

                let res = tokio::select! {
                    request = self.requests.recv() => match request {
                        Some(request) => self.handle_request(request).await,
                        None => Err(Error::Disconnected),
                    },
                    event = self.events.recv() => match event {
                        Some(ReaderEvent::Packet { sequence, payload }) => {
                            self.handle_packet(sequence, payload).await
                        }
                        Some(ReaderEvent::NeedRekey) => {
                            self.rekey_wanted = true;
                            Ok(())
                        }
                        Some(ReaderEvent::Error(err)) => Err(err),
                        None => Err(Error::Disconnected),
                    },
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        Err(Error::protocol("rekey timed out"))
                    }
                    _ = sleep_until(keepalive.unwrap_or_else(Instant::now)), if keepalive.is_some() => {
                        self.send_keepalive().await
                    }
                };

                let res = match res {
                    Ok(()) if self.rekey_wanted && !self.kex.active() => {
                        self.rekey_wanted = false;
                        tracing::debug!("starting rekey");
                        self.start_kex().await
                    }
                    res => res,
                };
                if let Err(err) = res {
                    break err;
                }
            },
        };
        self.terminate(err).await;
    }

    async fn terminate(&mut self, err: Error) {
        match &err {
            Error::Disconnected => tracing::debug!("session closed"),
            err => tracing::info!("session terminated: {err}"),
        }
        let peer_gone = matches!(err, Error::Disconnect { .. } | Error::Io { .. });
        if !self.disconnect_sent && !peer_gone {
            let reason = err.disconnect_reason();
            let _ = self.send_disconnect(reason, &err.to_string()).await;
        }

        self.state.active.store(false, Ordering::Release);
        *lock(&self.state.error) = Some(err.clone());

        for (_, mut entry) in self.channels.drain() {
            entry.fail(&err);
        }
        for (_, (_, sender)) in self.pending_opens.drain() {
            let _ = sender.send(Err(err.clone()));
        }
        for reply in self.global_replies.drain(..) {
            match reply {
                GlobalReply::Raw(sender) => drop(sender.send(Err(err.clone()))),
                GlobalReply::Forward { sender, .. } => drop(sender.send(Err(err.clone()))),
                GlobalReply::Cancel { sender, .. } => drop(sender.send(Err(err.clone()))),
            }
        }
        for sender in self.kex_waiters.drain(..) {
            let _ = sender.send(Err(err.clone()));
        }
        if let Some(pending) = self.pending_auth.take() {
            let _ = pending.sender.send(Err(err.clone()));
        }
        let _ = self.writer.shutdown().await;
    }

    async fn send_disconnect(&mut self, reason: DisconnectReson, desc: &str) -> Result<()> {
        self.disconnect_sent = true;
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_DISCONNECT);
        buffer.put_u32(reason.0);
        buffer.put_one(desc);
        buffer.put_one("");
        self.writer.send(buffer.as_ref()).await
    }

    async fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        if self.role == Role::Server && payload.first() == Some(&SSH_MSG_USERAUTH_SUCCESS) {
            // SUCCESS itself goes out uncompressed
            let packet = self.writer.seal(payload)?;
            self.state.authed.store(true, Ordering::Release);
            self.writer.write_raw(&packet).await?;
        } else {
            self.writer.send(payload).await?;
        }
        if self.writer.need_rekey() && !self.kex.active() {
            self.rekey_wanted = true;
        }
        Ok(())
    }

    /// Sends a payload, holding back anything but transport and key
    /// exchange messages while a key exchange is in flight.
    async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        let code = payload.first().copied().unwrap_or_default();
        let transport = matches!(code, 1..=4 | 20..=49);
        if self.kex.gate_closed() && !transport {
            self.deferred.push_back(payload);
            return Ok(());
        }
        self.write_payload(&payload).await
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_GLOBAL_REQUEST);
        buffer.put_one("keepalive@lag.net");
        buffer.put_bool(false);
        self.send(buffer.into_vec()).await
    }

    fn alloc_channel_id(&mut self) -> u32 {
        loop {
            let id = self.next_channel;
            self.next_channel = self.next_channel.wrapping_add(1);
            if !self.channels.contains_key(&id) && !self.pending_opens.contains_key(&id) {
                return id;
            }
        }
    }

    // ---- key exchange ----

    async fn start_kex(&mut self) -> Result<()> {
        if self.kex.ours.is_some() {
            return Ok(());
        }
        let payload = Methods::from_config(&self.config, self.role).to_kexinit()?;
        self.kex.ours = Some(payload.clone());
        self.kex.deadline = Some(Instant::now() + self.config.rekey_timeout);
        tracing::debug!("sending KEXINIT");
        self.send(payload).await?;
        if self.kex.theirs.is_some() {
            self.begin_exchange().await?;
        }
        Ok(())
    }

    async fn on_kexinit(&mut self, payload: Vec<u8>) -> Result<()> {
        if self.kex.theirs.is_some() {
            return Err(Error::protocol("duplicate KEXINIT"));
        }
        self.kex.theirs = Some(payload);
        if self.kex.ours.is_none() {
            tracing::debug!("peer started a key exchange");
            return self.start_kex().await;
        }
        self.begin_exchange().await
    }

    fn kex_context(&self) -> Result<KexContext<'_>> {
        let (Some(ours), Some(theirs), Some(negotiated)) =
            (&self.kex.ours, &self.kex.theirs, &self.kex.negotiated)
        else {
            return Err(Error::ub("key exchange state is incomplete"));
        };
        let (client_kexinit, server_kexinit) = match self.role {
            Role::Client => (ours.as_slice(), theirs.as_slice()),
            Role::Server => (theirs.as_slice(), ours.as_slice()),
        };
        Ok(KexContext {
            role: self.role,
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit,
            server_kexinit,
            host_key: self.config.host_key(&negotiated.host_key),
            moduli: &self.config.moduli,
        })
    }

    async fn begin_exchange(&mut self) -> Result<()> {
        let (Some(ours), Some(theirs)) = (&self.kex.ours, &self.kex.theirs) else {
            return Ok(());
        };
        let ours = Methods::parse(ours)?;
        let theirs = Methods::parse(theirs)?;
        let negotiated = match self.role {
            Role::Client => handshake::negotiate(&ours, &theirs)?,
            Role::Server => handshake::negotiate(&theirs, &ours)?,
        };
        self.kex.skip_guess = handshake::wrong_guess(&theirs, &negotiated);

        let mut engine = self
            .config
            .key_exchange
            .get(&negotiated.kex)
            .map(|factory| factory.create())
            .ok_or_else(|| Error::ub(format!("no engine for {}", negotiated.kex)))?;
        tracing::debug!("kex {} with host key {}", negotiated.kex, negotiated.host_key);
        self.kex.negotiated = Some(negotiated);

        let step = engine.start(&self.kex_context()?)?;
        self.kex.engine = Some(engine);
        self.apply_kex_step(step).await
    }

    async fn on_kex_packet(&mut self, payload: Vec<u8>) -> Result<()> {
        if std::mem::take(&mut self.kex.skip_guess) {
            tracing::debug!("dropping wrongly guessed kex packet");
            return Ok(());
        }
        let Some(mut engine) = self.kex.engine.take() else {
            return Err(Error::protocol(format!(
                "unexpected kex message {}",
                payload.first().copied().unwrap_or_default()
            )));
        };
        let step = engine.on_packet(&self.kex_context()?, &payload);
        self.kex.engine = Some(engine);
        self.apply_kex_step(step?).await
    }

    async fn apply_kex_step(&mut self, step: KexStep) -> Result<()> {
        for payload in step.send {
            self.send(payload).await?;
        }
        match step.output {
            Some(output) => self.finish_exchange(output).await,
            None => Ok(()),
        }
    }

    fn check_host_key(&self, output: &KexOutput, negotiated: &Negotiated) -> Result<()> {
        let key = decode_public_key(&output.host_key).map_err(|_| Error::HostKeyVerifyFailed)?;
        if key.name() != negotiated.host_key
            || !key.verify(&output.exchange_hash, &output.signature)
        {
            return Err(Error::HostKeyVerifyFailed);
        }
        if let Some(store) = &self.config.host_key_store {
            if let Some(known) = store.lookup(&self.config.hostname, key.name()) {
                if !known.same_key(key.as_ref()) {
                    tracing::warn!("host key for {} changed", self.config.hostname);
                    return Err(Error::HostKeyMismatch);
                }
            }
        }
        Ok(())
    }

    async fn finish_exchange(&mut self, output: KexOutput) -> Result<()> {
        let negotiated = self
            .kex
            .negotiated
            .clone()
            .ok_or_else(|| Error::ub("finished a kex that never started"))?;
        if self.role == Role::Client {
            self.check_host_key(&output, &negotiated)?;
            *lock(&self.state.host_key) = Some(output.host_key.clone());
        }

        let session_id = self
            .state
            .session_id
            .get_or_init(|| output.exchange_hash.clone())
            .clone();
        let hash = match &self.kex.engine {
            Some(engine) => engine.hash()?,
            None => return Err(Error::ub("kex engine is gone")),
        };
        let (outbound, inbound) = handshake::new_keys(
            &self.config,
            self.role,
            &negotiated,
            KeyMaterial {
                hash,
                secret: &output.secret,
                exchange_hash: &output.exchange_hash,
                session_id: &session_id,
            },
        )?;

        self.writer.send(&[SSH_MSG_NEWKEYS]).await?;
        self.writer.install(outbound);
        self.kex.newkeys_sent = true;
        self.keys.send(inbound).map_err(|_| Error::Disconnected)?;

        while let Some(payload) = self.deferred.pop_front() {
            self.write_payload(&payload).await?;
        }
        self.finish_kex_if_done();
        Ok(())
    }

    fn on_newkeys(&mut self) -> Result<()> {
        if !self.kex.active() {
            return Err(Error::protocol("NEWKEYS outside of a key exchange"));
        }
        self.kex.newkeys_received = true;
        self.finish_kex_if_done();
        Ok(())
    }

    fn finish_kex_if_done(&mut self) {
        if !(self.kex.newkeys_sent && self.kex.newkeys_received) {
            return;
        }
        self.kex = KexState::default();
        let count = self.state.kex_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("key exchange {count} finished");
        for sender in self.kex_waiters.drain(..) {
            let _ = sender.send(Ok(()));
        }
    }

    // ---- requests from handles ----

    async fn handle_request(&mut self, request: Request) -> Result<()> {
        match request {
            Request::Disconnect { reason, desc } => {
                self.send_disconnect(reason, &desc).await?;
                return Err(Error::Disconnected);
            }
            Request::Userauth {
                username,
                method,
                payload,
                handler,
                sender,
            } => {
                if self.role == Role::Server {
                    let _ = sender.send(Err(Error::invalid_argument(
                        "a server does not authenticate itself",
                    )));
                    return Ok(());
                }
                if let Some(pending) = &self.pending_auth {
                    if !pending.sender.is_closed() {
                        let _ = sender.send(Err(Error::invalid_argument(
                            "another authentication is in progress",
                        )));
                        return Ok(());
                    }
                }
                let mut pending = PendingAuth {
                    method,
                    username,
                    payload: Some(payload),
                    handler,
                    sender,
                };
                if self.service_accepted {
                    if let Some(payload) = pending.payload.take() {
                        self.send(payload).await?;
                    }
                } else if !self.service_requested {
                    self.service_requested = true;
                    let mut buffer = Buffer::new();
                    buffer.put_u8(SSH_MSG_SERVICE_REQUEST);
                    buffer.put_one(SERVICE_USERAUTH);
                    self.send(buffer.into_vec()).await?;
                }
                self.pending_auth = Some(pending);
            }
            Request::Renegotiate { sender } => {
                self.kex_waiters.push(sender);
                self.start_kex().await?;
            }
            Request::Ignore { data } => {
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_IGNORE);
                buffer.put_one(data);
                self.send(buffer.into_vec()).await?;
            }
            Request::SetKeepalive(interval) => self.keepalive = interval,
            Request::GlobalRequest { name, data, sender } => {
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_GLOBAL_REQUEST);
                buffer.put_one(&name);
                buffer.put_bool(sender.is_some());
                buffer.put_bytes(data);
                if let Some(sender) = sender {
                    self.global_replies.push_back(GlobalReply::Raw(sender));
                }
                self.send(buffer.into_vec()).await?;
            }
            Request::PortForward {
                address,
                port,
                sender,
            } => {
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_GLOBAL_REQUEST);
                buffer.put_one("tcpip-forward");
                buffer.put_bool(true);
                buffer.put_one(&address);
                buffer.put_u32(port);
                self.global_replies.push_back(GlobalReply::Forward {
                    address,
                    port,
                    sender,
                });
                self.send(buffer.into_vec()).await?;
            }
            Request::CancelPortForward {
                address,
                port,
                sender,
            } => {
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_GLOBAL_REQUEST);
                buffer.put_one("cancel-tcpip-forward");
                buffer.put_bool(true);
                buffer.put_one(&address);
                buffer.put_u32(port);
                self.global_replies.push_back(GlobalReply::Cancel {
                    address,
                    port,
                    sender,
                });
                self.send(buffer.into_vec()).await?;
            }
            Request::ChannelOpen {
                kind,
                extra,
                sender,
            } => {
                let id = self.alloc_channel_id();
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_CHANNEL_OPEN);
                buffer.put_one(&kind);
                buffer.put_u32(id);
                buffer.put_u32(self.config.window_size);
                buffer.put_u32(self.config.max_packet_size);
                buffer.put_bytes(extra);
                tracing::debug!("opening {kind} channel {id}");
                self.pending_opens.insert(id, (kind, sender));
                self.send(buffer.into_vec()).await?;
            }
            Request::ChannelData {
                id,
                ext,
                data,
                sender,
            } => {
                let Some(entry) = self.channels.get_mut(&id) else {
                    let _ = sender.send(Err(Error::ChannelClosed));
                    return Ok(());
                };
                if entry.close_sent || entry.close_received {
                    let _ = sender.send(Err(Error::ChannelClosed));
                    return Ok(());
                }
                if entry.eof_sent || !entry.eof_waiters.is_empty() {
                    let _ = sender.send(Err(Error::ChannelEof));
                    return Ok(());
                }
                entry.writes.push_back(PendingWrite { ext, data, sender });
                self.pump_writes(id).await?;
            }
            Request::ChannelRequest {
                id,
                name,
                data,
                sender,
            } => {
                let Some(entry) = self.channels.get_mut(&id) else {
                    if let Some(sender) = sender {
                        let _ = sender.send(Err(Error::ChannelClosed));
                    }
                    return Ok(());
                };
                if entry.close_sent || entry.close_received {
                    if let Some(sender) = sender {
                        let _ = sender.send(Err(Error::ChannelClosed));
                    }
                    return Ok(());
                }
                if name == "x11-req" {
                    self.x11_requested = true;
                }
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_CHANNEL_REQUEST);
                buffer.put_u32(entry.remote_id);
                buffer.put_one(&name);
                buffer.put_bool(sender.is_some());
                buffer.put_bytes(data);
                if let Some(sender) = sender {
                    entry.requests.push_back(sender);
                }
                self.send(buffer.into_vec()).await?;
            }
            Request::ChannelWindowAdjust { id, count } => {
                let Some(entry) = self.channels.get_mut(&id) else {
                    return Ok(());
                };
                if entry.close_received {
                    return Ok(());
                }
                entry.local_window = entry.local_window.saturating_add(count);
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_CHANNEL_WINDOW_ADJUST);
                buffer.put_u32(entry.remote_id);
                buffer.put_u32(count);
                tracing::trace!("channel {id}: window adjust {count}");
                self.send(buffer.into_vec()).await?;
            }
            Request::ChannelEof { id, sender } => {
                let Some(entry) = self.channels.get_mut(&id) else {
                    let _ = sender.send(Err(Error::ChannelClosed));
                    return Ok(());
                };
                if entry.eof_sent || entry.close_sent {
                    let _ = sender.send(Ok(()));
                    return Ok(());
                }
                // parked writes go out first
                entry.eof_waiters.push(sender);
                self.pump_writes(id).await?;
            }
            Request::ChannelClose { id, sender } => {
                self.close_channel(id).await?;
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(()));
                }
            }
        }
        Ok(())
    }

    async fn send_eof(&mut self, id: u32) -> Result<()> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if entry.eof_sent {
            return Ok(());
        }
        entry.eof_sent = true;
        if let Some(handle) = entry.handle.upgrade() {
            handle.state().eof_sent = true;
        }
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_CHANNEL_EOF);
        buffer.put_u32(entry.remote_id);
        tracing::debug!("channel {id}: EOF sent");
        self.send(buffer.into_vec()).await
    }

    async fn close_channel(&mut self, id: u32) -> Result<()> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if entry.close_sent {
            return Ok(());
        }
        entry.fail(&Error::ChannelClosed);
        self.send_eof(id).await?;

        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        entry.close_sent = true;
        let remote_id = entry.remote_id;
        let done = entry.close_received;
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_CHANNEL_CLOSE);
        buffer.put_u32(remote_id);
        tracing::debug!("channel {id}: CLOSE sent");
        self.send(buffer.into_vec()).await?;
        if done {
            self.channels.remove(&id);
        }
        Ok(())
    }

    /// Sends parked writes as far as the peer's window allows.
    async fn pump_writes(&mut self, id: u32) -> Result<()> {
        loop {
            let Some(entry) = self.channels.get_mut(&id) else {
                return Ok(());
            };
            let Some(write) = entry.writes.front() else {
                if !entry.eof_waiters.is_empty() {
                    let waiters = std::mem::take(&mut entry.eof_waiters);
                    self.send_eof(id).await?;
                    for sender in waiters {
                        let _ = sender.send(Ok(()));
                    }
                }
                return Ok(());
            };
            if write.sender.is_closed() {
                // the writer timed out or went away
                entry.writes.pop_front();
                continue;
            }
            if entry.remote_window == 0 {
                return Ok(());
            }

            let chunk = write
                .data
                .len()
                .min(entry.remote_window as usize)
                .min(entry.remote_max as usize - 64)
                .min(PAYLOAD_MAXIMUM_SIZE);
            let mut buffer = Buffer::new();
            match write.ext {
                None => {
                    buffer.put_u8(SSH_MSG_CHANNEL_DATA);
                    buffer.put_u32(entry.remote_id);
                }
                Some(code) => {
                    buffer.put_u8(SSH_MSG_CHANNEL_EXTENDED_DATA);
                    buffer.put_u32(entry.remote_id);
                    buffer.put_u32(code);
                }
            }
            buffer.put_one(&write.data[..chunk]);

            entry.remote_window -= chunk as u32;
            if let Some(handle) = entry.handle.upgrade() {
                handle
                    .out_window
                    .store(entry.remote_window, Ordering::Release);
            }
            if let Some(write) = entry.writes.pop_front() {
                let _ = write.sender.send(Ok(chunk));
            }
            self.send(buffer.into_vec()).await?;
        }
    }

    // ---- messages from the peer ----

    async fn handle_packet(&mut self, sequence: u32, payload: Vec<u8>) -> Result<()> {
        let msg = Message::parse(&payload).map_err(Error::protocol)?;
        match msg {
            Message::Disconnect {
                reason,
                description,
            } => {
                tracing::info!("peer disconnected: {reason:?} {description}");
                return Err(Error::Disconnect {
                    reason,
                    desc: description,
                });
            }
            Message::Ignore => {}
            Message::Debug {
                always_display,
                msg,
            } => {
                if always_display {
                    tracing::info!("peer debug: {msg}");
                } else {
                    tracing::debug!("peer debug: {msg}");
                }
            }
            Message::Unimplemented(sequence) => {
                tracing::warn!("peer rejected our packet {sequence}");
            }
            Message::ServiceRequest(service) => self.on_service_request(service).await?,
            Message::ServiceAccept(service) => {
                if self.role == Role::Server || service != SERVICE_USERAUTH {
                    return Err(Error::protocol(format!("unexpected SERVICE_ACCEPT {service}")));
                }
                self.service_accepted = true;
                let payload = self
                    .pending_auth
                    .as_mut()
                    .and_then(|pending| pending.payload.take());
                if let Some(payload) = payload {
                    self.send(payload).await?;
                }
            }
            Message::KexInit => self.on_kexinit(payload).await?,
            Message::NewKeys => self.on_newkeys()?,
            Message::Kex => self.on_kex_packet(payload).await?,
            Message::UserauthRequest {
                username,
                service,
                method,
                rest,
            } => self.on_userauth_request(username, service, method, rest).await?,
            Message::UserauthFailure { methods, partial } => {
                self.on_userauth_failure(methods, partial)
            }
            Message::UserauthSuccess => self.on_userauth_success(),
            Message::UserauthBanner(banner) => {
                tracing::debug!("auth banner: {banner}");
                *lock(&self.state.banner) = Some(banner);
            }
            Message::UserauthMethod => self.on_userauth_method(payload).await?,
            Message::GlobalRequest {
                name,
                want_reply,
                data,
            } => self.on_global_request(name, want_reply, data).await?,
            Message::RequestSuccess(data) => self.on_global_reply(Some(data))?,
            Message::RequestFailure => self.on_global_reply(None)?,
            Message::ChannelOpen {
                kind,
                sender,
                window,
                maximum,
                extra,
            } => self.on_channel_open(kind, sender, window, maximum, extra).await?,
            Message::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
                maximum,
            } => {
                let Some((kind, reply)) = self.pending_opens.remove(&recipient) else {
                    return Err(Error::protocol(format!(
                        "confirmation for unknown channel {recipient}"
                    )));
                };
                tracing::debug!("channel {recipient} ({kind}) opened");
                let channel = self.register_channel(recipient, kind, sender, window, maximum);
                let _ = reply.send(Ok(channel));
            }
            Message::ChannelOpenFailure {
                recipient,
                reason,
                desc,
            } => {
                if let Some((kind, reply)) = self.pending_opens.remove(&recipient) {
                    tracing::debug!("{kind} channel refused: {reason:?} {desc}");
                    let _ = reply.send(Err(Error::ChannelOpenDenied { reason, desc }));
                }
            }
            Message::ChannelWindowAdjust { recipient, count } => {
                if let Some(entry) = self.channels.get_mut(&recipient) {
                    entry.remote_window = entry.remote_window.saturating_add(count);
                    if let Some(handle) = entry.handle.upgrade() {
                        handle
                            .out_window
                            .store(entry.remote_window, Ordering::Release);
                    }
                    self.pump_writes(recipient).await?;
                }
            }
            Message::ChannelData { recipient, data } => self.on_channel_data(recipient, None, data),
            Message::ChannelExtendedData {
                recipient,
                code,
                data,
            } => self.on_channel_data(recipient, Some(code), data),
            Message::ChannelEof(recipient) => {
                if let Some(entry) = self.channels.get(&recipient) {
                    tracing::debug!("channel {recipient}: EOF received");
                    if let Some(handle) = entry.handle.upgrade() {
                        handle.receive_eof();
                    }
                }
            }
            Message::ChannelClose(recipient) => self.on_channel_close(recipient).await?,
            Message::ChannelRequest {
                recipient,
                name,
                want_reply,
                data,
            } => self.on_channel_request(recipient, name, want_reply, data).await?,
            Message::ChannelSuccess(recipient) => self.on_channel_reply(recipient, true),
            Message::ChannelFailure(recipient) => self.on_channel_reply(recipient, false),
            Message::Unknown(code) => {
                tracing::debug!("unimplemented message {code}, packet {sequence}");
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_UNIMPLEMENTED);
                buffer.put_u32(sequence);
                self.send(buffer.into_vec()).await?;
            }
        }
        Ok(())
    }

    async fn on_service_request(&mut self, service: String) -> Result<()> {
        if self.role == Role::Server && service == SERVICE_USERAUTH {
            let mut buffer = Buffer::new();
            buffer.put_u8(SSH_MSG_SERVICE_ACCEPT);
            buffer.put_one(&service);
            return self.send(buffer.into_vec()).await;
        }
        tracing::warn!("refusing service {service}");
        self.send_disconnect(
            DisconnectReson::SERVICE_NOT_AVAILABLE,
            &format!("service {service} not available"),
        )
        .await?;
        Err(Error::Disconnected)
    }

    // ---- authentication, client side ----

    fn on_userauth_success(&mut self) {
        let Some(pending) = self.pending_auth.take() else {
            tracing::warn!("USERAUTH_SUCCESS without a pending request");
            return;
        };
        tracing::info!("authentication ({}) successful", pending.method);
        *lock(&self.state.username) = Some(pending.username);
        let _ = pending.sender.send(Ok(vec![]));
    }

    fn on_userauth_failure(&mut self, methods: Vec<String>, partial: bool) {
        let Some(pending) = self.pending_auth.take() else {
            tracing::warn!("USERAUTH_FAILURE without a pending request");
            return;
        };
        let res = if partial {
            tracing::info!("authentication continues with {methods:?}");
            Ok(methods)
        } else if !methods.contains(&pending.method) {
            tracing::info!("auth method {} not allowed", pending.method);
            Err(Error::BadAuthMethod { allowed: methods })
        } else {
            tracing::info!("authentication ({}) failed", pending.method);
            Err(Error::AuthDenied)
        };
        let _ = pending.sender.send(res);
    }

    async fn on_userauth_method(&mut self, payload: Vec<u8>) -> Result<()> {
        if self.role == Role::Server {
            let Some(server) = self.server.clone() else {
                return Ok(());
            };
            let step = self
                .server_auth
                .on_method_message(server.as_ref(), &payload)
                .await?;
            return self.apply_auth_step(step).await;
        }

        let Some(method) = self.pending_auth.as_ref().map(|p| p.method.clone()) else {
            return Err(Error::protocol("userauth message without a pending request"));
        };
        match (method.as_str(), payload[0]) {
            ("password", SSH_MSG_USERAUTH_PASSWD_CHANGEREQ) => {
                let prompt = auth::parse_passwd_changereq(&payload);
                if let Some(pending) = self.pending_auth.take() {
                    let _ = pending.sender.send(Err(Error::PasswordExpired { prompt }));
                }
            }
            ("keyboard-interactive", SSH_MSG_USERAUTH_INFO_REQUEST) => {
                let query = auth::parse_info_request(&payload)?;
                let handler = self
                    .pending_auth
                    .as_mut()
                    .and_then(|pending| pending.handler.as_mut());
                let responses = match handler {
                    Some(handler) => handler(&query.name, &query.instructions, &query.prompts),
                    None => vec![],
                };
                self.send(auth::info_response(&responses)).await?;
            }
            (method, code) => {
                tracing::debug!("ignoring userauth message {code} during {method}");
            }
        }
        Ok(())
    }

    // ---- authentication, server side ----

    async fn on_userauth_request(
        &mut self,
        username: String,
        service: String,
        method: String,
        rest: Vec<u8>,
    ) -> Result<()> {
        let Some(server) = self.server.clone() else {
            return Err(Error::protocol("USERAUTH_REQUEST sent to a client"));
        };
        let session_id = self.state.session_id.get().cloned().unwrap_or_default();
        let step = self
            .server_auth
            .on_request(server.as_ref(), &session_id, username, service, method, &rest)
            .await?;
        self.apply_auth_step(step).await
    }

    async fn apply_auth_step(&mut self, step: Option<ServerAuthStep>) -> Result<()> {
        match step {
            None => Ok(()),
            Some(ServerAuthStep::Reply(send)) => {
                for payload in send {
                    self.send(payload).await?;
                }
                Ok(())
            }
            Some(ServerAuthStep::Success(send)) => {
                *lock(&self.state.username) = self.server_auth.username.clone();
                for payload in send {
                    self.send(payload).await?;
                }
                Ok(())
            }
            Some(ServerAuthStep::Disconnect { send, reason, desc }) => {
                for payload in send {
                    self.send(payload).await?;
                }
                self.send_disconnect(reason, &desc).await?;
                Err(Error::Disconnected)
            }
        }
    }

    // ---- global requests ----

    async fn on_global_request(&mut self, name: String, want_reply: bool, data: Vec<u8>) -> Result<()> {
        let reply = match (&self.server, name.as_str()) {
            (_, name) if name.starts_with("keepalive@") => None,
            (Some(server), "tcpip-forward") => {
                let server = server.clone();
                let buffer = Buffer::from_slice(&data);
                match (buffer.take_string(), buffer.take_u32()) {
                    (Some(address), Some(port)) => {
                        match server.check_port_forward_request(&address, port).await {
                            Some(bound) if port == 0 => Some(bound.to_be_bytes().to_vec()),
                            Some(_) => Some(vec![]),
                            None => None,
                        }
                    }
                    _ => None,
                }
            }
            (Some(server), "cancel-tcpip-forward") => {
                let server = server.clone();
                let buffer = Buffer::from_slice(&data);
                match (buffer.take_string(), buffer.take_u32()) {
                    (Some(address), Some(port)) => {
                        server.cancel_port_forward_request(&address, port).await;
                        Some(vec![])
                    }
                    _ => None,
                }
            }
            (Some(server), name) => {
                let server = server.clone();
                server.check_global_request(name, &data).await
            }
            (None, name) => {
                tracing::debug!("refusing global request {name}");
                None
            }
        };
        if !want_reply {
            return Ok(());
        }
        let mut buffer = Buffer::new();
        match reply {
            Some(data) => {
                buffer.put_u8(SSH_MSG_REQUEST_SUCCESS);
                buffer.put_bytes(data);
            }
            None => buffer.put_u8(SSH_MSG_REQUEST_FAILURE),
        }
        self.send(buffer.into_vec()).await
    }

    fn on_global_reply(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        let Some(reply) = self.global_replies.pop_front() else {
            return Err(Error::protocol("global reply without a request"));
        };
        match (reply, data) {
            (GlobalReply::Raw(sender), data) => {
                let _ = sender.send(Ok(data));
            }
            (
                GlobalReply::Forward {
                    address,
                    port,
                    sender,
                },
                Some(data),
            ) => {
                let bound = match port {
                    0 => Buffer::from_slice(&data).take_u32().unwrap_or_default(),
                    port => port,
                };
                tracing::debug!("forwarding {address}:{bound}");
                self.forwards.push((address, bound));
                let _ = sender.send(Ok(bound));
            }
            (GlobalReply::Forward { sender, .. }, None) => {
                let _ = sender.send(Err(Error::RequestFailure {
                    tip: "tcpip-forward refused".to_string(),
                }));
            }
            (
                GlobalReply::Cancel {
                    address,
                    port,
                    sender,
                },
                reply,
            ) => {
                self.forwards.retain(|(a, p)| !(*a == address && *p == port));
                let res = match reply {
                    Some(_) => Ok(()),
                    None => Err(Error::RequestFailure {
                        tip: "cancel-tcpip-forward refused".to_string(),
                    }),
                };
                let _ = sender.send(res);
            }
        }
        Ok(())
    }

    // ---- channels ----

    fn register_channel(
        &mut self,
        id: u32,
        kind: String,
        remote_id: u32,
        window: u32,
        maximum: u32,
    ) -> Channel {
        let channel = Channel::new(id, kind, self.sender.clone(), self.config.window_size);
        channel.0.out_window.store(window, Ordering::Release);
        self.channels.insert(
            id,
            ChannelEntry {
                handle: Arc::downgrade(&channel.0),
                remote_id,
                remote_window: window,
                remote_max: maximum.max(MIN_PACKET_SIZE),
                local_window: self.config.window_size,
                eof_sent: false,
                close_sent: false,
                close_received: false,
                writes: VecDeque::new(),
                eof_waiters: vec![],
                requests: VecDeque::new(),
            },
        );
        channel
    }

    async fn on_channel_open(
        &mut self,
        kind: String,
        remote_id: u32,
        window: u32,
        maximum: u32,
        extra: Vec<u8>,
    ) -> Result<()> {
        let id = self.alloc_channel_id();
        let decision = match &self.server {
            Some(server) => {
                let server = server.clone();
                if !self.server_auth.authenticated {
                    Err(ChannelOpenFailureReson::ADMINISTRATIVELY_PROHIBITED)
                } else {
                    server.check_channel_request(&kind, id, &extra).await
                }
            }
            None => {
                let buffer = Buffer::from_slice(&extra);
                match kind.as_str() {
                    "forwarded-tcpip" => {
                        let address = buffer.take_string().unwrap_or_default();
                        let port = buffer.take_u32().unwrap_or_default();
                        if self.forwards.iter().any(|(a, p)| *a == address && *p == port) {
                            Ok(())
                        } else {
                            Err(ChannelOpenFailureReson::ADMINISTRATIVELY_PROHIBITED)
                        }
                    }
                    "x11" if self.x11_requested => Ok(()),
                    _ => Err(ChannelOpenFailureReson::ADMINISTRATIVELY_PROHIBITED),
                }
            }
        };

        let mut buffer = Buffer::new();
        match decision {
            Ok(()) => {
                tracing::debug!("accepted {kind} channel {id}");
                let channel = self.register_channel(id, kind, remote_id, window, maximum);
                buffer.put_u8(SSH_MSG_CHANNEL_OPEN_CONFIRMATION);
                buffer.put_u32(remote_id);
                buffer.put_u32(id);
                buffer.put_u32(self.config.window_size);
                buffer.put_u32(self.config.max_packet_size);
                self.send(buffer.into_vec()).await?;
                let _ = self.accept.send(channel);
            }
            Err(reason) => {
                tracing::debug!("refused {kind} channel: {reason:?}");
                buffer.put_u8(SSH_MSG_CHANNEL_OPEN_FAILURE);
                buffer.put_u32(remote_id);
                buffer.put_u32(reason.0);
                buffer.put_one("");
                buffer.put_one("");
                self.send(buffer.into_vec()).await?;
            }
        }
        Ok(())
    }

    fn on_channel_data(&mut self, recipient: u32, ext: Option<u32>, data: Vec<u8>) {
        let Some(entry) = self.channels.get_mut(&recipient) else {
            tracing::debug!("data for unknown channel {recipient}");
            return;
        };
        if entry.close_received {
            return;
        }
        if data.len() > entry.local_window as usize {
            tracing::warn!(
                "channel {recipient}: peer sent {} bytes with a window of {}",
                data.len(),
                entry.local_window
            );
        }
        entry.local_window = entry.local_window.saturating_sub(data.len() as u32);
        if let Some(handle) = entry.handle.upgrade() {
            handle.receive(ext, &data);
        }
    }

    async fn on_channel_close(&mut self, recipient: u32) -> Result<()> {
        let Some(entry) = self.channels.get_mut(&recipient) else {
            return Ok(());
        };
        tracing::debug!("channel {recipient}: CLOSE received");
        entry.close_received = true;
        entry.fail(&Error::ChannelClosed);
        if entry.close_sent {
            self.channels.remove(&recipient);
            return Ok(());
        }
        self.close_channel(recipient).await
    }

    fn on_channel_reply(&mut self, recipient: u32, success: bool) {
        let Some(sender) = self
            .channels
            .get_mut(&recipient)
            .and_then(|entry| entry.requests.pop_front())
        else {
            tracing::debug!("unsolicited channel reply for {recipient}");
            return;
        };
        let res = match success {
            true => Ok(()),
            false => Err(Error::ChannelFailure),
        };
        let _ = sender.send(res);
    }

    async fn on_channel_request(
        &mut self,
        recipient: u32,
        name: String,
        want_reply: bool,
        data: Vec<u8>,
    ) -> Result<()> {
        let Some(entry) = self.channels.get(&recipient) else {
            tracing::debug!("request {name} for unknown channel {recipient}");
            return Ok(());
        };
        let remote_id = entry.remote_id;
        let handle = entry.handle();
        let buffer = Buffer::from_slice(&data);

        let ok = match name.as_str() {
            "exit-status" => match (buffer.take_u32(), &handle) {
                (Some(code), Some(handle)) => {
                    handle.0.set_exit_status(ExitStatus::Normal(code));
                    true
                }
                _ => false,
            },
            "exit-signal" => {
                let signal = buffer.take_string();
                let core_dumped = buffer.take_bool().unwrap_or_default();
                let error_msg = buffer.take_string().unwrap_or_default();
                match (signal, &handle) {
                    (Some(signal), Some(handle)) => {
                        handle.0.set_exit_status(ExitStatus::Interrupt {
                            signal: Signal(signal),
                            core_dumped,
                            error_msg,
                        });
                        true
                    }
                    _ => false,
                }
            }
            "xon-xoff" => {
                tracing::debug!(
                    "channel {recipient}: client flow control allowed: {:?}",
                    buffer.take_bool()
                );
                true
            }
            _ => match (self.server.clone(), handle) {
                (Some(server), Some(channel)) => {
                    server_channel_request(&self.config.subsystems, server.as_ref(), &channel, &name, &data)
                        .await
                }
                _ => {
                    tracing::debug!("refusing channel request {name}");
                    false
                }
            },
        };

        if want_reply {
            let mut buffer = Buffer::new();
            buffer.put_u8(match ok {
                true => SSH_MSG_CHANNEL_SUCCESS,
                false => SSH_MSG_CHANNEL_FAILURE,
            });
            buffer.put_u32(remote_id);
            self.send(buffer.into_vec()).await?;
        }
        Ok(())
    }
}

async fn server_channel_request(
    subsystems: &IndexMap<String, Arc<dyn SubsystemHandler>>,
    server: &dyn ServerInterface,
    channel: &Channel,
    name: &str,
    data: &[u8],
) -> bool {
    let buffer = Buffer::from_slice(data);
    match name {
        "pty-req" => {
            let pty = (|| {
                Some(PtyRequest {
                    term: buffer.take_string()?,
                    columns: buffer.take_u32()?,
                    rows: buffer.take_u32()?,
                    width: buffer.take_u32()?,
                    height: buffer.take_u32()?,
                    modes: buffer.take_one()?.1.to_vec(),
                })
            })();
            match pty {
                Some(pty) => server.check_channel_pty_request(channel, &pty).await,
                None => false,
            }
        }
        "shell" => server.check_channel_shell_request(channel).await,
        "exec" => match buffer.take_one().map(|v| v.1.to_vec()) {
            Some(command) => server.check_channel_exec_request(channel, &command).await,
            None => false,
        },
        "subsystem" => {
            let Some(subsystem) = buffer.take_string() else {
                return false;
            };
            match subsystems.get(&subsystem).cloned() {
                Some(handler) => {
                    tracing::debug!("starting subsystem {subsystem} on channel {}", channel.id());
                    let channel = channel.clone();
                    tokio::spawn(async move { handler.start(&subsystem, channel).await });
                    true
                }
                None => {
                    server
                        .check_channel_subsystem_request(channel, &subsystem)
                        .await
                }
            }
        }
        "window-change" => {
            let size = (|| {
                Some((
                    buffer.take_u32()?,
                    buffer.take_u32()?,
                    buffer.take_u32()?,
                    buffer.take_u32()?,
                ))
            })();
            match size {
                Some((columns, rows, width, height)) => {
                    server
                        .check_channel_window_change_request(channel, columns, rows, width, height)
                        .await
                }
                None => false,
            }
        }
        "x11-req" => {
            let x11 = (|| {
                Some((
                    buffer.take_bool()?,
                    buffer.take_string()?,
                    buffer.take_string()?,
                    buffer.take_u32()?,
                ))
            })();
            match x11 {
                Some((single, protocol, cookie, screen)) => {
                    server
                        .check_channel_x11_request(channel, single, &protocol, &cookie, screen)
                        .await
                }
                None => false,
            }
        }
        "auth-agent-req@openssh.com" => server.check_channel_forward_agent_request(channel).await,
        "env" => {
            let env = (|| Some((buffer.take_string()?, buffer.take_one()?.1.to_vec())))();
            match env {
                Some((name, value)) => server.check_channel_env_request(channel, &name, &value).await,
                None => false,
            }
        }
        "signal" => match buffer.take_string() {
            Some(signal) => server.check_channel_signal_request(channel, &signal).await,
            None => false,
        },
        other => {
            tracing::debug!("unsupported channel request {other}");
            false
        }
    }
}
