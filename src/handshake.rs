use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use openssl::rand::rand_bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    cipher::{
        compress::{self, Decode, Encode},
        crypt::{self, Decrypt, Encrypt},
        hash::Hash,
        kex::{self, KeyExchange, ModulusPool},
        mac::{self, Mac},
        sign::{self, PrivateKey},
        first_unknown, Boxtory,
    },
    error::{builder, Error, Result},
    keys::HostKeyStore,
    server::SubsystemHandler,
    ssh::{
        buffer::Buffer,
        common::{code::*, *},
        stream::{BufferReader, InboundKeys, OutboundKeys, PacketWriter, RekeyLimits},
    },
};

/// Most non-banner lines tolerated before the peer's identification.
const MAXIMUM_BANNER_NOISE: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

pub struct Config {
    /// Software id put into our identification line.
    pub client_id: String,
    pub key_exchange: IndexMap<String, Boxtory<dyn KeyExchange + Send>>,
    pub hostkey: Vec<String>,
    pub encrypt: IndexMap<String, Boxtory<dyn Encrypt + Send>>,
    pub decrypt: IndexMap<String, Boxtory<dyn Decrypt + Send>>,
    pub mac: IndexMap<String, Boxtory<dyn Mac + Send>>,
    pub compress: IndexMap<String, Boxtory<dyn Encode + Send>>,
    pub decompress: IndexMap<String, Boxtory<dyn Decode + Send>>,
    pub rekey_bytes: u64,
    pub rekey_packets: u64,
    pub rekey_timeout: Duration,
    pub banner_timeout: Duration,
    pub auth_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub window_size: u32,
    pub max_packet_size: u32,
    /// Server only.
    pub host_keys: Vec<Arc<dyn PrivateKey>>,
    /// Server only, primes for group exchange.
    pub moduli: ModulusPool,
    /// Server only, subsystems started on request.
    pub subsystems: IndexMap<String, Arc<dyn SubsystemHandler>>,
    /// Client only.
    pub host_key_store: Option<Arc<dyn HostKeyStore>>,
    pub hostname: String,
}

impl Default for Config {
    fn default() -> Self {
        fn convert<K: ToString, V>(value: IndexMap<K, V>) -> IndexMap<String, V> {
            value.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
        }

        Self {
            client_id: format!("{}_{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            key_exchange: convert(kex::new_all()),
            hostkey: sign::all().iter().map(|v| v.to_string()).collect(),
            encrypt: convert(crypt::new_encrypt_all()),
            decrypt: convert(crypt::new_decrypt_all()),
            mac: convert(mac::new_all()),
            compress: convert(compress::new_encode_all()),
            decompress: convert(compress::new_decode_all()),
            rekey_bytes: REKEY_BYTES,
            rekey_packets: REKEY_PACKETS,
            rekey_timeout: Duration::from_secs(30),
            banner_timeout: Duration::from_secs(15),
            auth_timeout: Duration::from_secs(30),
            keepalive_interval: None,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            host_keys: vec![],
            moduli: ModulusPool::default(),
            subsystems: IndexMap::new(),
            host_key_store: None,
            hostname: String::new(),
        }
    }
}

impl Config {
    pub fn disable_compress(&mut self) {
        self.compress.clear();
        self.decompress.clear();
        self.compress
            .insert("none".to_string(), Box::new(compress::none_encode));
        self.decompress
            .insert("none".to_string(), Box::new(compress::none_decode));
    }

    /// Prefers compression, delayed zlib first.
    pub fn enable_compress(&mut self) {
        for name in ["zlib", "zlib@openssh.com"] {
            if let Some(index) = self.compress.get_index_of(name) {
                self.compress.move_index(index, 0);
            }
            if let Some(index) = self.decompress.get_index_of(name) {
                self.decompress.move_index(index, 0);
            }
        }
    }

    pub fn with_host_key(mut self, key: Arc<dyn PrivateKey>) -> Self {
        self.host_keys.push(key);
        self
    }

    pub fn add_subsystem(&mut self, name: impl Into<String>, handler: Arc<dyn SubsystemHandler>) {
        self.subsystems.insert(name.into(), handler);
    }

    pub(crate) fn rekey_limits(&self) -> RekeyLimits {
        RekeyLimits {
            bytes: self.rekey_bytes,
            packets: self.rekey_packets,
            ..Default::default()
        }
    }

    pub fn validate(&self, role: Role) -> Result<()> {
        let invalid_arg = |tip: &str| Err(Error::invalid_argument(tip));

        if self.key_exchange.is_empty() {
            return invalid_arg("key exchange is empty");
        }
        if self.hostkey.is_empty() {
            return invalid_arg("hostkey is empty");
        }
        if let Some(name) = first_unknown(&self.hostkey, sign::all()) {
            return invalid_arg(&format!("unsupported hostkey algorithm: {name}"));
        }
        if self.encrypt.is_empty() || self.decrypt.is_empty() {
            return invalid_arg("crypt is empty");
        }
        if self.mac.is_empty() {
            return invalid_arg("mac is empty");
        }
        if self.compress.is_empty() || self.decompress.is_empty() {
            return invalid_arg("compress is empty, 'none' should be provided at least");
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return invalid_arg("max packet size is below 1024");
        }
        if self.window_size == 0 {
            return invalid_arg("window size is zero");
        }
        if role == Role::Server && self.host_keys.is_empty() {
            return invalid_arg("server has no host key");
        }
        Ok(())
    }

    pub(crate) fn host_key(&self, name: &str) -> Option<&dyn PrivateKey> {
        self.host_keys
            .iter()
            .find(|key| key.name() == name)
            .map(|key| key.as_ref())
    }
}

/// Sends our identification line and reads the peer's, skipping noise
/// lines. Returns both lines without CRLF.
pub(crate) async fn banner_exchange<R, W>(
    reader: &mut BufferReader<R>,
    writer: &mut PacketWriter<W>,
    client_id: &str,
) -> Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = format!("SSH-2.0-{client_id}");
    writer.write_raw(format!("{ours}\r\n").as_bytes()).await?;

    for _ in 0..=MAXIMUM_BANNER_NOISE {
        let line = reader.read_line().await?;
        if !line.starts_with(b"SSH-") {
            tracing::debug!("banner: {}", String::from_utf8_lossy(&line));
            continue;
        }
        let version = line[4..].split(|&b| b == b'-').next().unwrap_or_default();
        if version != b"2.0" && version != b"1.99" {
            return builder::Banner {
                tip: format!(
                    "incompatible ssh peer: {}",
                    String::from_utf8_lossy(&line)
                ),
            }
            .fail();
        }
        tracing::info!("connected to {}", String::from_utf8_lossy(&line));
        return Ok((ours.into_bytes(), line));
    }
    builder::Banner {
        tip: "too many lines before the identification string",
    }
    .fail()
}

/// The name-lists of one KEXINIT.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Methods {
    pub kex: Vec<String>,
    pub host_key: Vec<String>,
    pub crypt_client_to_server: Vec<String>,
    pub crypt_server_to_client: Vec<String>,
    pub mac_client_to_server: Vec<String>,
    pub mac_server_to_client: Vec<String>,
    pub compress_client_to_server: Vec<String>,
    pub compress_server_to_client: Vec<String>,
    pub lang_client_to_server: Vec<String>,
    pub lang_server_to_client: Vec<String>,
    pub first_kex_follows: bool,
}

impl Methods {
    pub fn from_config(config: &Config, role: Role) -> Self {
        fn convert<'a>(methods: impl IntoIterator<Item = &'a String>) -> Vec<String> {
            methods.into_iter().cloned().collect()
        }

        let host_key = match role {
            Role::Client => config.hostkey.clone(),
            Role::Server => config
                .hostkey
                .iter()
                .filter(|name| config.host_key(name).is_some())
                .cloned()
                .collect(),
        };

        let (outbound_crypt, inbound_crypt) = (
            convert(config.encrypt.keys()),
            convert(config.decrypt.keys()),
        );
        let (outbound_compress, inbound_compress) = (
            convert(config.compress.keys()),
            convert(config.decompress.keys()),
        );
        let mac = convert(config.mac.keys());

        let (crypt_client_to_server, crypt_server_to_client, compress_client_to_server, compress_server_to_client) =
            match role {
                Role::Client => (outbound_crypt, inbound_crypt, outbound_compress, inbound_compress),
                Role::Server => (inbound_crypt, outbound_crypt, inbound_compress, outbound_compress),
            };

        Self {
            kex: convert(config.key_exchange.keys()),
            host_key,
            crypt_client_to_server,
            crypt_server_to_client,
            mac_client_to_server: mac.clone(),
            mac_server_to_client: mac,
            compress_client_to_server,
            compress_server_to_client,
            lang_client_to_server: vec![],
            lang_server_to_client: vec![],
            first_kex_follows: false,
        }
    }

    pub fn to_kexinit(&self) -> Result<Vec<u8>> {
        let mut cookie = [0; 16];
        rand_bytes(&mut cookie)?;

        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_KEXINIT);
        buffer.put_bytes(cookie);
        for list in self.lists() {
            buffer.put_name_list(list);
        }
        buffer.put_bool(self.first_kex_follows);
        buffer.put_u32(0);
        Ok(buffer.into_vec())
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let parser = || {
            let buffer = Buffer::from_slice(payload);
            if buffer.take_u8()? != SSH_MSG_KEXINIT {
                return None;
            }
            buffer.take_bytes(16)?;
            let get = || buffer.take_name_list();
            let mut methods = Methods {
                kex: get()?,
                host_key: get()?,
                crypt_client_to_server: get()?,
                crypt_server_to_client: get()?,
                mac_client_to_server: get()?,
                mac_server_to_client: get()?,
                compress_client_to_server: get()?,
                compress_server_to_client: get()?,
                lang_client_to_server: get()?,
                lang_server_to_client: get()?,
                first_kex_follows: false,
            };
            methods.first_kex_follows = buffer.take_bool()?;
            buffer.take_u32()?;
            Some(methods)
        };
        parser().ok_or_else(|| Error::protocol("invalid kexinit"))
    }

    fn lists(&self) -> [&Vec<String>; 10] {
        [
            &self.kex,
            &self.host_key,
            &self.crypt_client_to_server,
            &self.crypt_server_to_client,
            &self.mac_client_to_server,
            &self.mac_server_to_client,
            &self.compress_client_to_server,
            &self.compress_server_to_client,
            &self.lang_client_to_server,
            &self.lang_server_to_client,
        ]
    }
}

/// Algorithms agreed for one key exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub kex: String,
    pub host_key: String,
    pub crypt_client_to_server: String,
    pub crypt_server_to_client: String,
    pub mac_client_to_server: String,
    pub mac_server_to_client: String,
    pub compress_client_to_server: String,
    pub compress_server_to_client: String,
}

fn match_method(what: &str, client: &[String], server: &[String]) -> Result<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| Error::Negotiation {
            what: format!("{what} (client: {client:?}, server: {server:?})"),
        })
}

pub(crate) fn negotiate(client: &Methods, server: &Methods) -> Result<Negotiated> {
    let negotiated = Negotiated {
        kex: match_method("kex", &client.kex, &server.kex)?,
        host_key: match_method("host key", &client.host_key, &server.host_key)?,
        crypt_client_to_server: match_method(
            "cipher",
            &client.crypt_client_to_server,
            &server.crypt_client_to_server,
        )?,
        crypt_server_to_client: match_method(
            "cipher",
            &client.crypt_server_to_client,
            &server.crypt_server_to_client,
        )?,
        mac_client_to_server: match_method(
            "mac",
            &client.mac_client_to_server,
            &server.mac_client_to_server,
        )?,
        mac_server_to_client: match_method(
            "mac",
            &client.mac_server_to_client,
            &server.mac_server_to_client,
        )?,
        compress_client_to_server: match_method(
            "compression",
            &client.compress_client_to_server,
            &server.compress_client_to_server,
        )?,
        compress_server_to_client: match_method(
            "compression",
            &client.compress_server_to_client,
            &server.compress_server_to_client,
        )?,
    };
    tracing::debug!("negotiated {negotiated:?}");
    Ok(negotiated)
}

/// Whether the packet a peer sent on a guess has to be thrown away.
pub(crate) fn wrong_guess(peer: &Methods, negotiated: &Negotiated) -> bool {
    peer.first_kex_follows
        && (peer.kex.first() != Some(&negotiated.kex)
            || peer.host_key.first() != Some(&negotiated.host_key))
}

fn calculate(
    hash: &mut dyn Hash,
    secret: &[u8],
    session_id: &[u8],
    h: &[u8],
    letter: u8,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = vec![];

    hash.update(secret)?;
    hash.update(h)?;
    hash.update(&[letter])?;
    hash.update(session_id)?;
    out.extend(hash.finalize()?);

    while out.len() < len {
        hash.update(secret)?;
        hash.update(h)?;
        hash.update(&out)?;
        out.extend(hash.finalize()?);
    }

    out.truncate(len);
    Ok(out)
}

/// Secret material of one finished exchange.
pub(crate) struct KeyMaterial<'a> {
    pub hash: Box<dyn Hash + Send>,
    /// K as an mpint string
    pub secret: &'a [u8],
    pub exchange_hash: &'a [u8],
    pub session_id: &'a [u8],
}

fn lookup<T: ?Sized>(map: &IndexMap<String, Boxtory<T>>, name: &str) -> Result<Box<T>> {
    map.get(name)
        .map(|factory| factory.create())
        .ok_or_else(|| Error::ub(format!("negotiated an unregistered algorithm: {name}")))
}

/// Builds the cipher, mac and compression state of both directions.
pub(crate) fn new_keys(
    config: &Config,
    role: Role,
    negotiated: &Negotiated,
    mut material: KeyMaterial,
) -> Result<(OutboundKeys, InboundKeys)> {
    // (cipher, mac, compress, iv letter, key letter, mac letter)
    let client_to_server = (
        &negotiated.crypt_client_to_server,
        &negotiated.mac_client_to_server,
        &negotiated.compress_client_to_server,
        b'A',
        b'C',
        b'E',
    );
    let server_to_client = (
        &negotiated.crypt_server_to_client,
        &negotiated.mac_server_to_client,
        &negotiated.compress_server_to_client,
        b'B',
        b'D',
        b'F',
    );
    let (outbound, inbound) = match role {
        Role::Client => (client_to_server, server_to_client),
        Role::Server => (server_to_client, client_to_server),
    };

    let mut derive = |letter: u8, len: usize| {
        calculate(
            material.hash.as_mut(),
            material.secret,
            material.session_id,
            material.exchange_hash,
            letter,
            len,
        )
    };

    let mut encrypt = lookup(&config.encrypt, outbound.0)?;
    let iv = derive(outbound.3, encrypt.iv_len())?;
    let key = derive(outbound.4, encrypt.key_len())?;
    encrypt.initialize(&iv, &key)?;
    let mut out_mac = lookup(&config.mac, outbound.1)?;
    out_mac.initialize(&derive(outbound.5, out_mac.key_len())?)?;

    let mut decrypt = lookup(&config.decrypt, inbound.0)?;
    let iv = derive(inbound.3, decrypt.iv_len())?;
    let key = derive(inbound.4, decrypt.key_len())?;
    decrypt.initialize(&iv, &key)?;
    let mut in_mac = lookup(&config.mac, inbound.1)?;
    in_mac.initialize(&derive(inbound.5, in_mac.key_len())?)?;

    Ok((
        OutboundKeys {
            encrypt,
            mac: Some(out_mac),
            encode: lookup(&config.compress, outbound.2)?,
        },
        InboundKeys {
            decrypt,
            mac: Some(in_mac),
            decode: lookup(&config.decompress, inbound.2)?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::hash::MdWrapper;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn negotiation_prefers_client_order() {
        let config = Config::default();
        let client = Methods::from_config(&config, Role::Client);
        let mut server = client.clone();
        server.crypt_client_to_server = vec!["aes256-ctr".into(), "3des-cbc".into()];
        server.mac_server_to_client = vec!["hmac-md5".into()];

        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "diffie-hellman-group1-sha1");
        assert_eq!(negotiated.host_key, "ssh-rsa");
        assert_eq!(negotiated.crypt_client_to_server, "aes256-ctr");
        assert_eq!(negotiated.crypt_server_to_client, "aes128-ctr");
        assert_eq!(negotiated.mac_server_to_client, "hmac-md5");
        assert_eq!(negotiated.compress_client_to_server, "none");

        server.kex = vec!["curve25519-sha256".into()];
        assert!(matches!(
            negotiate(&client, &server),
            Err(Error::Negotiation { .. })
        ));
    }

    #[test]
    fn kexinit_round_trip() {
        let mut config = Config::default();
        config.enable_compress();
        let mut methods = Methods::from_config(&config, Role::Client);
        methods.first_kex_follows = true;
        let payload = methods.to_kexinit().unwrap();
        assert_eq!(Methods::parse(&payload).unwrap(), methods);
        assert_eq!(methods.compress_client_to_server[0], "zlib@openssh.com");

        assert!(Methods::parse(&payload[..30]).is_err());
    }

    #[test]
    fn server_only_offers_owned_host_keys() {
        use openssl::{pkey::PKey, rsa::Rsa};

        let key = sign::private_key_from_pkey(PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap())
            .unwrap();
        let config = Config::default().with_host_key(key.into());
        let methods = Methods::from_config(&config, Role::Server);
        assert_eq!(methods.host_key, vec!["ssh-rsa".to_string()]);
        assert!(config.validate(Role::Server).is_ok());
        assert!(Config::default().validate(Role::Server).is_err());
    }

    #[test]
    fn key_extension() {
        let secret = b"\x00\x00\x00\x01\x07";
        let h = [1u8; 20];
        let sid = [2u8; 20];
        let mut hash = MdWrapper::sha1().unwrap();
        let key = calculate(&mut hash, secret, &sid, &h, b'C', 64).unwrap();
        assert_eq!(key.len(), 64);

        let first = MdWrapper::digest(
            openssl::md::Md::sha1(),
            &[&secret[..], &h, b"C", &sid].concat(),
        )
        .unwrap();
        assert_eq!(&key[..20], &first[..]);
        let second =
            MdWrapper::digest(openssl::md::Md::sha1(), &[&secret[..], &h, &first].concat())
                .unwrap();
        assert_eq!(&key[20..40], &second[..]);
    }

    #[tokio::test]
    async fn banner_skips_noise() {
        let (a, b) = duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, mut b_write) = tokio::io::split(b);

        let mut reader = BufferReader::new(a_read);
        let mut writer = PacketWriter::new(a_write, RekeyLimits::default(), Arc::new(AtomicBool::new(false)));

        b_write
            .write_all(b"hello\r\nthis is noise\nSSH-2.0-OpenSSH_9.0 comment\r\n")
            .await
            .unwrap();
        let (ours, theirs) = banner_exchange(&mut reader, &mut writer, "tester")
            .await
            .unwrap();
        assert_eq!(ours, b"SSH-2.0-tester");
        assert_eq!(theirs, b"SSH-2.0-OpenSSH_9.0 comment");

        let mut peer = BufferReader::new(b_read);
        assert_eq!(peer.read_line().await.unwrap(), b"SSH-2.0-tester");
    }

    #[tokio::test]
    async fn banner_rejects_old_versions() {
        let (a, b) = duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (_b_read, mut b_write) = tokio::io::split(b);
        let mut reader = BufferReader::new(a_read);
        let mut writer = PacketWriter::new(a_write, RekeyLimits::default(), Arc::new(AtomicBool::new(false)));

        b_write.write_all(b"SSH-1.5-ancient\r\n").await.unwrap();
        assert!(matches!(
            banner_exchange(&mut reader, &mut writer, "tester").await,
            Err(Error::Banner { .. })
        ));
    }
}
