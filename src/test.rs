use std::{
    collections::{BTreeMap, BTreeSet},
    io::SeekFrom,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::{thread_rng, Rng};

use crate::{
    channel::Channel,
    error::{Error, Result},
    keys::{self, PrivateKey, PublicKey},
    msg::ChannelOpenFailureReson,
    server::{AuthResult, InteractiveAuth, InteractiveQuery, ServerInterface},
    sftp::{
        Attributes, FileInfo, FilesystemInterface, OpenFlags, Permissions, SftpHandle, SftpServer,
    },
    Config, Session,
};

const RSA: &[u8] = include_bytes!("../tests/data/test_rsa.key");
const DSS: &[u8] = include_bytes!("../tests/data/test_dss.key");
const WAIT: Option<Duration> = Some(Duration::from_secs(10));

struct TestServer {
    dss: Box<dyn PublicKey>,
    paranoid: AtomicBool,
}

impl TestServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            dss: dss_key().public_key(),
            paranoid: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ServerInterface for TestServer {
    fn allowed_auths(&self, _username: &str) -> Vec<String> {
        if self.paranoid.load(Ordering::SeqCst) {
            return vec!["publickey".to_string()];
        }
        ["password", "publickey", "keyboard-interactive"]
            .map(String::from)
            .to_vec()
    }

    async fn check_auth_password(&self, username: &str, password: &str) -> AuthResult {
        match (username, password) {
            ("slowdive", "pygmalion") => AuthResult::Successful,
            ("paranoid", "paranoid") => {
                self.paranoid.store(true, Ordering::SeqCst);
                AuthResult::PartiallySuccessful
            }
            _ => AuthResult::Failed,
        }
    }

    async fn check_auth_publickey(&self, username: &str, key: &dyn PublicKey) -> AuthResult {
        let allowed = match username {
            "paranoid" => self.paranoid.load(Ordering::SeqCst),
            _ => true,
        };
        if allowed && key.same_key(self.dss.as_ref()) {
            AuthResult::Successful
        } else {
            AuthResult::Failed
        }
    }

    async fn check_auth_interactive(&self, _username: &str, _submethods: &str) -> InteractiveAuth {
        InteractiveAuth::Query(InteractiveQuery::new("password", "").add_prompt("Password", false))
    }

    async fn check_auth_interactive_response(&self, responses: &[String]) -> InteractiveAuth {
        match responses {
            [answer] if answer == "cat" => InteractiveAuth::Finished(AuthResult::Successful),
            _ => InteractiveAuth::Finished(AuthResult::Failed),
        }
    }

    async fn check_channel_request(
        &self,
        kind: &str,
        _id: u32,
        _extra: &[u8],
    ) -> std::result::Result<(), ChannelOpenFailureReson> {
        match kind {
            "session" => Ok(()),
            _ => Err(ChannelOpenFailureReson::ADMINISTRATIVELY_PROHIBITED),
        }
    }

    async fn check_channel_exec_request(&self, channel: &Channel, command: &[u8]) -> bool {
        if command != b"yes" {
            return false;
        }
        let channel = channel.clone();
        tokio::spawn(async move {
            channel.write_all(b"Hello there.\n").await?;
            channel.write_stderr_all(b"This is on stderr.\n").await?;
            channel.close().await
        });
        true
    }
}

#[derive(Clone)]
struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
    append: bool,
}

#[async_trait]
impl SftpHandle for MemoryFile {
    async fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = (start + len as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&mut self, offset: u64, chunk: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = if self.append {
            data.len()
        } else {
            offset as usize
        };
        if data.len() < start + chunk.len() {
            data.resize(start + chunk.len(), 0);
        }
        data[start..start + chunk.len()].copy_from_slice(chunk);
        Ok(())
    }

    async fn stat(&mut self) -> Result<Attributes> {
        Ok(file_attrs(self.data.lock().unwrap().len()))
    }
}

fn file_attrs(size: usize) -> Attributes {
    Attributes::default()
        .with_size(size as u64)
        .with_permissions(Permissions::REGULAR | Permissions::p0644())
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("/", path),
    }
}

fn missing(path: &str) -> Error {
    Error::NoSuchFile {
        tip: path.to_string(),
    }
}

/// Flat in-memory tree keyed by absolute path.
struct MemoryFs {
    files: Mutex<BTreeMap<String, Arc<Mutex<Vec<u8>>>>>,
    dirs: Mutex<BTreeSet<String>>,
}

impl MemoryFs {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::from(["/".to_string()])),
        })
    }
}

#[async_trait]
impl FilesystemInterface for MemoryFs {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        _attrs: &Attributes,
    ) -> Result<Box<dyn SftpHandle>> {
        if !self.dirs.lock().unwrap().contains(split_path(path).0) {
            return Err(missing(path));
        }
        let mut files = self.files.lock().unwrap();
        let exists = files.contains_key(path);
        if exists && flags.contains(OpenFlags::EXCL) {
            return Err(Error::SFtpFailure {
                tip: format!("{path} exists"),
            });
        }
        if !exists && !flags.contains(OpenFlags::CREAT) {
            return Err(missing(path));
        }
        let data = files.entry(path.to_string()).or_default().clone();
        if flags.contains(OpenFlags::TRUNC) {
            data.lock().unwrap().clear();
        }
        Ok(Box::new(MemoryFile {
            data,
            append: flags.contains(OpenFlags::APPEND),
        }))
    }

    async fn list_folder(&self, path: &str) -> Result<Vec<FileInfo>> {
        if !self.dirs.lock().unwrap().contains(path) {
            return Err(missing(path));
        }
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|(name, _)| split_path(name).0 == path)
            .map(|(name, data)| {
                FileInfo::new(
                    split_path(name).1.to_string(),
                    String::new(),
                    file_attrs(data.lock().unwrap().len()),
                )
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Attributes> {
        if let Some(data) = self.files.lock().unwrap().get(path) {
            return Ok(file_attrs(data.lock().unwrap().len()));
        }
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(Attributes::default().with_permissions(Permissions::DIRECTORY | Permissions::p0755()));
        }
        Err(missing(path))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| missing(path))
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let data = files.remove(old).ok_or_else(|| missing(old))?;
        files.insert(new.to_string(), data);
        Ok(())
    }

    async fn mkdir(&self, path: &str, _attrs: &Attributes) -> Result<()> {
        self.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }
}

fn dss_key() -> Arc<dyn PrivateKey> {
    keys::load_private_key(DSS, None).unwrap()
}

fn server_config() -> Config {
    Config::default().with_host_key(keys::load_private_key(RSA, None).unwrap())
}

async fn loopback(client: Config, server: Config, interface: Arc<dyn ServerInterface>) -> (Session, Session) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let accept = tokio::spawn(Session::accept(server, server_io, interface));
    let client = Session::connect(client, client_io).await.unwrap();
    let server = accept.await.unwrap().unwrap();
    (client, server)
}

async fn sftp_loopback() -> (Session, Session, crate::sftp::SftpClient) {
    let mut config = server_config();
    config.add_subsystem("sftp", Arc::new(SftpServer::new(MemoryFs::new())));
    let (client, server) = loopback(Config::default(), config, TestServer::new()).await;
    client.auth_password("slowdive", "pygmalion").await.unwrap();
    let sftp = client.open_sftp().await.unwrap();
    (client, server, sftp)
}

#[tokio::test]
async fn password_auth_and_exec() {
    let (client, server) = loopback(Config::default(), server_config(), TestServer::new()).await;
    assert!(client.remote_version().starts_with("SSH-2.0-"));
    assert!(server.remote_version().starts_with("SSH-2.0-"));
    assert!(client.remote_host_key().is_some());

    assert!(matches!(
        client.auth_password("slowdive", "wrong").await,
        Err(Error::AuthDenied)
    ));
    assert!(client
        .auth_password("slowdive", "pygmalion")
        .await
        .unwrap()
        .is_empty());
    assert!(client.is_authenticated());
    assert_eq!(client.username().as_deref(), Some("slowdive"));

    let channel = client.open_session().await.unwrap();
    channel.exec("yes").await.unwrap();
    assert_eq!(channel.read_to_end().await.unwrap(), b"Hello there.\n");
    assert_eq!(
        channel.read_stderr_to_end().await.unwrap(),
        b"This is on stderr.\n"
    );

    let accepted = server.accept_channel(WAIT).await.unwrap();
    assert_eq!(accepted.kind(), "session");
    assert!(client.open_session().await.unwrap().exec("no").await.is_err());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn publickey_auth_with_dss() {
    let (client, _server) = loopback(Config::default(), server_config(), TestServer::new()).await;
    let key = dss_key();
    assert!(client
        .auth_publickey("slowdive", key.as_ref())
        .await
        .unwrap()
        .is_empty());
    assert!(client.is_authenticated());

    let rsa = keys::load_private_key(RSA, None).unwrap();
    let (other, _server) = loopback(Config::default(), server_config(), TestServer::new()).await;
    assert!(other.auth_publickey("slowdive", rsa.as_ref()).await.is_err());
    assert!(!other.is_authenticated());
}

#[tokio::test]
async fn multi_step_auth() {
    let (client, _server) = loopback(Config::default(), server_config(), TestServer::new()).await;
    let remaining = client.auth_password("paranoid", "paranoid").await.unwrap();
    assert_eq!(remaining, ["publickey"]);
    assert!(!client.is_authenticated());

    let key = dss_key();
    assert!(client
        .auth_publickey("paranoid", key.as_ref())
        .await
        .unwrap()
        .is_empty());
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn rekey_under_load() {
    let mut config = Config::default();
    config.rekey_bytes = 16384;
    let (client, server) = loopback(config, server_config(), TestServer::new()).await;
    client.auth_password("slowdive", "pygmalion").await.unwrap();
    let before = client.session_id().unwrap();

    let data: Vec<u8> = {
        let mut rng = thread_rng();
        (0..20 * 1024).map(|_| rng.gen()).collect()
    };
    let channel = client.open_session().await.unwrap();
    let accepted = server.accept_channel(WAIT).await.unwrap();
    for chunk in data.chunks(1024) {
        channel.write_all(chunk).await.unwrap();
    }
    channel.send_eof().await.unwrap();
    assert_eq!(accepted.read_to_end().await.unwrap(), data);

    // 20 KiB past a 16 KiB threshold rekeys on its own
    tokio::time::timeout(Duration::from_secs(10), async {
        while client.kex_count() < 2 || server.kex_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let automatic = client.kex_count();

    client.renegotiate_keys().await.unwrap();
    assert_eq!(client.kex_count(), automatic + 1);
    accepted.write_all(b"still here").await.unwrap();
    assert_eq!(channel.read_exact(10).await.unwrap(), b"still here");

    assert_eq!(client.session_id().unwrap(), before);
    assert_eq!(server.session_id().unwrap(), before);
}

#[tokio::test]
async fn exhausted_window_blocks_writer() {
    let mut config = server_config();
    config.window_size = 4096;
    let (client, server) = loopback(Config::default(), config, TestServer::new()).await;
    client.auth_password("slowdive", "pygmalion").await.unwrap();
    let channel = client.open_session().await.unwrap();
    let accepted = server.accept_channel(WAIT).await.unwrap();

    let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let writer = {
        let channel = channel.clone();
        let data = data.clone();
        tokio::spawn(async move { channel.write_all(&data).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());
    assert!(!channel.send_ready());
    assert!(accepted.recv_ready());

    let mut got = vec![];
    while got.len() < data.len() {
        let chunk = accepted.read(1000).await.unwrap();
        assert!(!chunk.is_empty());
        got.extend(chunk);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    writer.await.unwrap().unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn eof_closes_one_direction() {
    let (client, server) = loopback(Config::default(), server_config(), TestServer::new()).await;
    client.auth_password("slowdive", "pygmalion").await.unwrap();
    let channel = client.open_session().await.unwrap();
    let accepted = server.accept_channel(WAIT).await.unwrap();

    channel.write_all(b"last words").await.unwrap();
    channel.send_eof().await.unwrap();
    assert!(matches!(
        channel.write_all(b"more").await,
        Err(Error::ChannelEof)
    ));
    assert_eq!(accepted.read_to_end().await.unwrap(), b"last words");
    assert!(accepted.eof_received());

    // the other direction still flows
    accepted.write_all(b"reply").await.unwrap();
    assert_eq!(channel.read_exact(5).await.unwrap(), b"reply");
    accepted.send_eof().await.unwrap();
    assert!(channel.read_to_end().await.unwrap().is_empty());
    assert!(channel.eof_received());
}

#[tokio::test]
async fn keyboard_interactive() {
    let (client, _server) = loopback(Config::default(), server_config(), TestServer::new()).await;
    let seen = Arc::new(Mutex::new(vec![]));
    let record = seen.clone();
    let remaining = client
        .auth_interactive(
            "slowdive",
            move |title: &str, _instructions: &str, prompts: &[(String, bool)]| {
                record
                    .lock()
                    .unwrap()
                    .push((title.to_string(), prompts.to_vec()));
                vec!["cat".to_string()]
            },
            "",
        )
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert!(client.is_authenticated());
    assert_eq!(
        *seen.lock().unwrap(),
        [("password".to_string(), vec![("Password".to_string(), false)])]
    );
}

#[tokio::test]
async fn sftp_write_read_round_trip() {
    let (_client, _server, sftp) = sftp_loopback().await;
    assert_eq!(sftp.version(), 3);
    assert_eq!(sftp.extension("check-file"), Some(&b"md5,sha1"[..]));

    // every 8 bytes hold their own offset
    let data: Vec<u8> = (0..(1u64 << 20) / 8).flat_map(|i| (i * 8).to_be_bytes()).collect();
    let local = std::env::temp_dir().join(format!("sshtrans-put-{}", std::process::id()));
    tokio::fs::write(&local, &data).await.unwrap();

    sftp.mkdir("/upload", Permissions::p0755()).await.unwrap();
    let attrs = sftp.put(&local, "/upload/big.bin").await.unwrap();
    assert_eq!(attrs.size, Some(1 << 20));
    assert_eq!(sftp.listdir("/upload").await.unwrap(), ["big.bin"]);
    assert_eq!(
        sftp.stat("/upload/big.bin").await.unwrap().size,
        Some(1048576)
    );

    assert_eq!(sftp.get("/upload/big.bin", &local).await.unwrap(), 1 << 20);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);
    let _ = tokio::fs::remove_file(&local).await;

    sftp.chdir(Some("/upload")).await.unwrap();
    assert_eq!(sftp.getcwd().as_deref(), Some("/upload"));
    assert_eq!(sftp.get_bytes("big.bin").await.unwrap(), data);

    sftp.rename("big.bin", "moved.bin").await.unwrap();
    assert!(matches!(
        sftp.stat("big.bin").await,
        Err(Error::NoSuchFile { .. })
    ));
    sftp.remove("moved.bin").await.unwrap();
    assert!(sftp.listdir("/upload").await.unwrap().is_empty());
}

#[tokio::test]
async fn sftp_prefetch_with_random_seeks() {
    let (_client, _server, sftp) = sftp_loopback().await;

    let mut content = Vec::with_capacity(1 << 20);
    for _ in 0..1024 {
        for n in 0..512u16 {
            content.extend(n.to_be_bytes());
        }
    }
    sftp.put_bytes(&content, "/pattern.bin").await.unwrap();

    let offsets: Vec<u64> = {
        let mut rng = thread_rng();
        (0..100)
            .map(|_| rng.gen_range(0..(content.len() - 793) as u64))
            .collect()
    };

    let mut file = sftp.file("/pattern.bin", "r").await.unwrap();
    file.prefetch(None).await.unwrap();
    for offset in offsets {
        assert_eq!(file.seek(SeekFrom::Start(offset)).await.unwrap(), offset);
        let chunk = file.read(793).await.unwrap();
        let start = offset as usize;
        assert_eq!(chunk, &content[start..start + 793]);
        assert_eq!(file.tell(), offset + 793);
    }

    let ranges = [(70000, 793), (0, 100_000), (content.len() as u64 - 10, 10)];
    let parts = file.readv(&ranges).await.unwrap();
    for ((offset, len), part) in ranges.iter().zip(&parts) {
        let start = *offset as usize;
        assert_eq!(part, &content[start..start + *len as usize]);
    }

    assert_eq!(file.seek(SeekFrom::End(-2)).await.unwrap(), content.len() as u64 - 2);
    assert_eq!(file.read(100).await.unwrap(), 511u16.to_be_bytes());
    assert!(file.read(100).await.unwrap().is_empty());
    file.close().await.unwrap();
}

#[tokio::test]
async fn sftp_prefetch_releases_consumed_blocks() {
    let (_client, _server, sftp) = sftp_loopback().await;
    let content: Vec<u8> = (0..1u32 << 20).map(|i| (i % 253) as u8).collect();
    sftp.put_bytes(&content, "/blocks.bin").await.unwrap();

    let mut file = sftp.file("/blocks.bin", "r").await.unwrap();
    file.prefetch(None).await.unwrap();
    assert_eq!(file.read(1000).await.unwrap(), &content[..1000]);
    // the first block's unread tail is all that's cached so far
    assert!(file.prefetched_bytes() < 32768);

    assert_eq!(file.read_to_end().await.unwrap(), &content[1000..]);
    assert_eq!(file.prefetched_bytes(), 0);
    file.close().await.unwrap();
}

#[tokio::test]
async fn sftp_check_file_and_errors() {
    let (_client, _server, sftp) = sftp_loopback().await;
    let data = vec![7u8; 3000];
    sftp.put_bytes(&data, "/seven").await.unwrap();

    let file = sftp.file("/seven", "r").await.unwrap();
    let whole = file.check(&["sha1"], 0, 0, 0).await.unwrap();
    assert_eq!(whole, openssl::sha::sha1(&data));
    let blocks = file.check(&["sha256", "md5"], 0, 0, 1024).await.unwrap();
    assert_eq!(blocks.len(), 3 * 16);
    assert!(file.check(&["md5"], 0, 0, 100).await.is_err());
    file.close().await.unwrap();

    assert!(matches!(
        sftp.file("/nowhere/x", "w").await,
        Err(Error::NoSuchFile { .. })
    ));
    assert!(sftp.file("/seven", "x").await.is_err());
    assert!(matches!(
        sftp.readlink("/seven").await,
        Err(Error::OpUnsupported { .. })
    ));
    assert_eq!(sftp.normalize("/a/./b/..").await.unwrap(), "/a");

    let mut appended = sftp.file("/seven", "a").await.unwrap();
    appended.write(b"!").await.unwrap();
    appended.close().await.unwrap();
    assert_eq!(sftp.stat("/seven").await.unwrap().size, Some(3001));
}
