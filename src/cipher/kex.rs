use std::collections::BTreeMap;

use super::*;
use crate::{
    cipher::{
        hash::{Hash, MdWrapper},
        sign::PrivateKey,
    },
    error::{Error, Result},
    handshake::Role,
    ssh::{buffer::Buffer, common::code::*},
};
use indexmap::IndexMap;
use openssl::{
    bn::{BigNum, BigNumContext, BigNumRef},
    error::ErrorStack,
};

algo_list!(
    all,
    new_all,
    new_kex_by_name,
    dyn KeyExchange + Send,
    "diffie-hellman-group1-sha1" => DhGroup::group1(),
    "diffie-hellman-group-exchange-sha1" => DhGroupExchange::new(),
    "diffie-hellman-group14-sha1" => DhGroup::group14(),
);

/// Everything an exchange needs from the transport.
pub struct KexContext<'a> {
    pub role: Role,
    pub client_version: &'a [u8],
    pub server_version: &'a [u8],
    pub client_kexinit: &'a [u8],
    pub server_kexinit: &'a [u8],
    /// The server's key for the negotiated host key algorithm.
    pub host_key: Option<&'a dyn PrivateKey>,
    pub moduli: &'a ModulusPool,
}

pub struct KexOutput {
    /// K, encoded as an mpint string
    pub secret: Vec<u8>,
    /// H
    pub exchange_hash: Vec<u8>,
    pub host_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Default)]
pub struct KexStep {
    pub send: Vec<Vec<u8>>,
    pub output: Option<KexOutput>,
}

impl KexStep {
    fn send(payload: Vec<u8>) -> Self {
        Self {
            send: vec![payload],
            output: None,
        }
    }
}

pub trait KeyExchange {
    fn name(&self) -> &str;
    /// The hash used for H and for key derivation.
    fn hash(&self) -> Result<Box<dyn Hash + Send>>;
    fn start(&mut self, ctx: &KexContext) -> Result<KexStep>;
    fn on_packet(&mut self, ctx: &KexContext, payload: &[u8]) -> Result<KexStep>;
}

struct KeyPair {
    x: BigNum,
    public: BigNum,
}

impl KeyPair {
    // 1 < x < (p - 1) / 2
    fn generate(p: &BigNumRef, g: &BigNumRef) -> Result<KeyPair> {
        let one = BigNum::from_u32(1)?;
        let mut p_minus_one = BigNum::new()?;
        p_minus_one.checked_sub(p, &one)?;
        let mut q = BigNum::new()?;
        q.rshift1(&p_minus_one)?;

        let mut x = BigNum::new()?;
        loop {
            q.rand_range(&mut x)?;
            if x > one {
                break;
            }
        }

        let mut ctx = BigNumContext::new()?;
        let mut public = BigNum::new()?;
        public.mod_exp(g, &x, p, &mut ctx)?;
        Ok(KeyPair { x, public })
    }

    fn shared(&self, peer: &BigNumRef, p: &BigNumRef) -> Result<BigNum> {
        check_range(peer, p)?;
        let mut ctx = BigNumContext::new()?;
        let mut k = BigNum::new()?;
        k.mod_exp(peer, &self.x, p, &mut ctx)?;
        Ok(k)
    }
}

// the peer's public value must lie in [2, p - 2]
fn check_range(value: &BigNumRef, p: &BigNumRef) -> Result<()> {
    let two = BigNum::from_u32(2)?;
    let mut upper = BigNum::new()?;
    upper.checked_sub(p, &two)?;
    if value < &*two || value > &*upper {
        return Err(Error::protocol("diffie-hellman value out of range"));
    }
    Ok(())
}

fn secret_bytes(k: &BigNumRef) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_mpint(k);
    buffer.into_vec()
}

fn parse_reply(payload: &[u8], expect: u8) -> Result<(Vec<u8>, BigNum, Vec<u8>)> {
    let parse = || {
        let buffer = Buffer::from_slice(payload);
        if buffer.take_u8()? != expect {
            return None;
        }
        let host_key = buffer.take_one()?.1.to_vec();
        let f = buffer.take_mpint()?;
        let signature = buffer.take_one()?.1.to_vec();
        Some((host_key, f, signature))
    };
    parse().ok_or_else(|| Error::protocol("invalid key exchange reply"))
}

fn single_mpint(payload: &[u8], expect: u8) -> Result<BigNum> {
    let buffer = Buffer::from_slice(payload);
    match (buffer.take_u8(), buffer.take_mpint()) {
        (Some(code), Some(num)) if code == expect => Ok(num),
        _ => Err(Error::protocol(format!("invalid key exchange message {expect}"))),
    }
}

fn build_reply(code: u8, host_key: &[u8], f: &BigNumRef, signature: &[u8]) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_u8(code);
    buffer.put_one(host_key);
    buffer.put_mpint(f);
    buffer.put_one(signature);
    buffer.into_vec()
}

fn server_key<'a>(ctx: &KexContext<'a>) -> Result<&'a dyn PrivateKey> {
    ctx.host_key
        .ok_or_else(|| Error::ub("server has no host key for the negotiated algorithm"))
}

fn unexpected(name: &str, payload: &[u8]) -> Error {
    Error::protocol(format!(
        "{name}: unexpected message {}",
        payload.first().copied().unwrap_or_default()
    ))
}

/// Exchange hash fields shared by all the diffie-hellman variants.
struct HashInput<'a> {
    host_key: &'a [u8],
    group: Option<(&'a [u8], &'a BigNumRef, &'a BigNumRef)>,
    e: &'a BigNumRef,
    f: &'a BigNumRef,
    k: &'a BigNumRef,
}

fn exchange_hash(ctx: &KexContext, input: HashInput) -> Result<Vec<u8>> {
    let mut buffer = Buffer::new();
    buffer.put_one(ctx.client_version);
    buffer.put_one(ctx.server_version);
    buffer.put_one(ctx.client_kexinit);
    buffer.put_one(ctx.server_kexinit);
    buffer.put_one(input.host_key);
    if let Some((range, p, g)) = input.group {
        buffer.put_bytes(range);
        buffer.put_mpint(p);
        buffer.put_mpint(g);
    }
    buffer.put_mpint(input.e);
    buffer.put_mpint(input.f);
    buffer.put_mpint(input.k);

    let mut hash = MdWrapper::sha1()?;
    hash.update(buffer.as_ref())?;
    hash.finalize()
}

/// diffie-hellman over a fixed Oakley group, generator 2.
struct DhGroup {
    name: &'static str,
    prime: fn() -> std::result::Result<BigNum, ErrorStack>,
    pair: Option<KeyPair>,
}

impl DhGroup {
    fn group1() -> Self {
        Self {
            name: "diffie-hellman-group1-sha1",
            prime: BigNum::get_rfc2409_prime_1024,
            pair: None,
        }
    }

    fn group14() -> Self {
        Self {
            name: "diffie-hellman-group14-sha1",
            prime: BigNum::get_rfc3526_prime_2048,
            pair: None,
        }
    }

    fn params(&self) -> Result<(BigNum, BigNum)> {
        Ok(((self.prime)()?, BigNum::from_u32(2)?))
    }
}

impl KeyExchange for DhGroup {
    fn name(&self) -> &str {
        self.name
    }

    fn hash(&self) -> Result<Box<dyn Hash + Send>> {
        Ok(Box::new(MdWrapper::sha1()?))
    }

    fn start(&mut self, ctx: &KexContext) -> Result<KexStep> {
        let (p, g) = self.params()?;
        let pair = KeyPair::generate(&p, &g)?;
        let step = match ctx.role {
            Role::Client => {
                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_KEXDH_INIT);
                buffer.put_mpint(&pair.public);
                KexStep::send(buffer.into_vec())
            }
            Role::Server => KexStep::default(),
        };
        self.pair = Some(pair);
        Ok(step)
    }

    fn on_packet(&mut self, ctx: &KexContext, payload: &[u8]) -> Result<KexStep> {
        let (p, _) = self.params()?;
        let pair = self
            .pair
            .as_ref()
            .ok_or_else(|| Error::ub("key exchange was not started"))?;

        match (ctx.role, payload.first().copied()) {
            (Role::Client, Some(SSH_MSG_KEXDH_REPLY)) => {
                let (host_key, f, signature) = parse_reply(payload, SSH_MSG_KEXDH_REPLY)?;
                let k = pair.shared(&f, &p)?;
                let h = exchange_hash(
                    ctx,
                    HashInput {
                        host_key: &host_key,
                        group: None,
                        e: &pair.public,
                        f: &f,
                        k: &k,
                    },
                )?;
                Ok(KexStep {
                    send: vec![],
                    output: Some(KexOutput {
                        secret: secret_bytes(&k),
                        exchange_hash: h,
                        host_key,
                        signature,
                    }),
                })
            }
            (Role::Server, Some(SSH_MSG_KEXDH_INIT)) => {
                let e = single_mpint(payload, SSH_MSG_KEXDH_INIT)?;
                let k = pair.shared(&e, &p)?;
                let key = server_key(ctx)?;
                let host_key = key.encode_public();
                let h = exchange_hash(
                    ctx,
                    HashInput {
                        host_key: &host_key,
                        group: None,
                        e: &e,
                        f: &pair.public,
                        k: &k,
                    },
                )?;
                let signature = key.sign(&h)?;
                let reply = build_reply(SSH_MSG_KEXDH_REPLY, &host_key, &pair.public, &signature);
                Ok(KexStep {
                    send: vec![reply],
                    output: Some(KexOutput {
                        secret: secret_bytes(&k),
                        exchange_hash: h,
                        host_key,
                        signature,
                    }),
                })
            }
            _ => Err(unexpected(self.name, payload)),
        }
    }
}

pub const GEX_MIN_BITS: u32 = 1024;
pub const GEX_PREFERRED_BITS: u32 = 2048;
pub const GEX_MAX_BITS: u32 = 8192;

/// diffie-hellman-group-exchange-sha1, RFC 4419.
struct DhGroupExchange {
    // the range fields exactly as they enter the exchange hash
    range: Vec<u8>,
    group: Option<(BigNum, BigNum)>,
    pair: Option<KeyPair>,
}

impl DhGroupExchange {
    fn new() -> Self {
        Self {
            range: vec![],
            group: None,
            pair: None,
        }
    }

    fn group(&self) -> Result<(&BigNum, &BigNum)> {
        self.group
            .as_ref()
            .map(|(p, g)| (p, g))
            .ok_or_else(|| Error::protocol("group exchange without a group"))
    }
}

impl KeyExchange for DhGroupExchange {
    fn name(&self) -> &str {
        "diffie-hellman-group-exchange-sha1"
    }

    fn hash(&self) -> Result<Box<dyn Hash + Send>> {
        Ok(Box::new(MdWrapper::sha1()?))
    }

    fn start(&mut self, ctx: &KexContext) -> Result<KexStep> {
        match ctx.role {
            Role::Client => {
                let mut range = Buffer::new();
                range.put_u32(GEX_MIN_BITS);
                range.put_u32(GEX_PREFERRED_BITS);
                range.put_u32(GEX_MAX_BITS);
                self.range = range.into_vec();

                let mut buffer = Buffer::new();
                buffer.put_u8(SSH_MSG_KEX_DH_GEX_REQUEST);
                buffer.put_bytes(&self.range);
                Ok(KexStep::send(buffer.into_vec()))
            }
            Role::Server => Ok(KexStep::default()),
        }
    }

    fn on_packet(&mut self, ctx: &KexContext, payload: &[u8]) -> Result<KexStep> {
        let buffer = Buffer::from_slice(payload);
        let code = buffer.take_u8().unwrap_or_default();
        match (ctx.role, code) {
            (Role::Client, SSH_MSG_KEX_DH_GEX_GROUP) if self.group.is_none() => {
                let (p, g) = buffer
                    .take_mpint()
                    .zip(buffer.take_mpint())
                    .ok_or_else(|| Error::protocol("invalid group exchange group"))?;
                let bits = p.num_bits() as u32;
                if bits < GEX_MIN_BITS || bits > GEX_MAX_BITS {
                    return Err(Error::protocol(format!(
                        "group exchange modulus out of range ({bits} bits)"
                    )));
                }
                let pair = KeyPair::generate(&p, &g)?;
                let mut init = Buffer::new();
                init.put_u8(SSH_MSG_KEX_DH_GEX_INIT);
                init.put_mpint(&pair.public);
                self.group = Some((p, g));
                self.pair = Some(pair);
                Ok(KexStep::send(init.into_vec()))
            }
            (Role::Client, SSH_MSG_KEX_DH_GEX_REPLY) => {
                let (host_key, f, signature) = parse_reply(payload, SSH_MSG_KEX_DH_GEX_REPLY)?;
                let (p, g) = self.group()?;
                let pair = self
                    .pair
                    .as_ref()
                    .ok_or_else(|| Error::protocol("group exchange reply before group"))?;
                let k = pair.shared(&f, p)?;
                let h = exchange_hash(
                    ctx,
                    HashInput {
                        host_key: &host_key,
                        group: Some((&self.range, p, g)),
                        e: &pair.public,
                        f: &f,
                        k: &k,
                    },
                )?;
                Ok(KexStep {
                    send: vec![],
                    output: Some(KexOutput {
                        secret: secret_bytes(&k),
                        exchange_hash: h,
                        host_key,
                        signature,
                    }),
                })
            }
            (Role::Server, SSH_MSG_KEX_DH_GEX_REQUEST | SSH_MSG_KEX_DH_GEX_REQUEST_OLD)
                if self.group.is_none() =>
            {
                let (min, preferred, max) = if code == SSH_MSG_KEX_DH_GEX_REQUEST {
                    let min = buffer.take_u32();
                    let preferred = buffer.take_u32();
                    let max = buffer.take_u32();
                    match (min, preferred, max) {
                        (Some(min), Some(preferred), Some(max)) if min <= preferred && preferred <= max => {
                            self.range = payload[1..13].to_vec();
                            (min, preferred, max)
                        }
                        _ => return Err(Error::protocol("invalid group exchange request")),
                    }
                } else {
                    let preferred = buffer
                        .take_u32()
                        .ok_or_else(|| Error::protocol("invalid group exchange request"))?;
                    self.range = preferred.to_be_bytes().to_vec();
                    (GEX_MIN_BITS.min(preferred), preferred, GEX_MAX_BITS.max(preferred))
                };

                let (p, g) = ctx
                    .moduli
                    .get_modulus(min, preferred, max)?
                    .ok_or_else(|| Error::protocol("no moduli available for group exchange"))?;
                tracing::debug!(
                    "picked {} bit modulus for request {min}/{preferred}/{max}",
                    p.num_bits()
                );

                let mut group = Buffer::new();
                group.put_u8(SSH_MSG_KEX_DH_GEX_GROUP);
                group.put_mpint(&p);
                group.put_mpint(&g);
                self.pair = Some(KeyPair::generate(&p, &g)?);
                self.group = Some((p, g));
                Ok(KexStep::send(group.into_vec()))
            }
            (Role::Server, SSH_MSG_KEX_DH_GEX_INIT) => {
                let e = single_mpint(payload, SSH_MSG_KEX_DH_GEX_INIT)?;
                let (p, g) = self.group()?;
                let pair = self
                    .pair
                    .as_ref()
                    .ok_or_else(|| Error::protocol("group exchange init before request"))?;
                let k = pair.shared(&e, p)?;
                let key = server_key(ctx)?;
                let host_key = key.encode_public();
                let h = exchange_hash(
                    ctx,
                    HashInput {
                        host_key: &host_key,
                        group: Some((&self.range, p, g)),
                        e: &e,
                        f: &pair.public,
                        k: &k,
                    },
                )?;
                let signature = key.sign(&h)?;
                let reply =
                    build_reply(SSH_MSG_KEX_DH_GEX_REPLY, &host_key, &pair.public, &signature);
                Ok(KexStep {
                    send: vec![reply],
                    output: Some(KexOutput {
                        secret: secret_bytes(&k),
                        exchange_hash: h,
                        host_key,
                        signature,
                    }),
                })
            }
            _ => Err(unexpected(self.name(), payload)),
        }
    }
}

/// Primes a server may hand out during group exchange, grouped by bit size.
#[derive(Clone, Debug)]
pub struct ModulusPool {
    pack: BTreeMap<u32, Vec<(Vec<u8>, u32)>>,
}

impl Default for ModulusPool {
    fn default() -> Self {
        let mut pool = Self::empty();
        // the two Oakley groups are always present
        if let Ok(p) = BigNum::get_rfc2409_prime_1024() {
            pool.add(&p, 2);
        }
        if let Ok(p) = BigNum::get_rfc3526_prime_2048() {
            pool.add(&p, 2);
        }
        pool
    }
}

impl ModulusPool {
    pub fn empty() -> Self {
        Self {
            pack: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, p: &BigNumRef, g: u32) {
        let bits = p.num_bits() as u32;
        self.pack.entry(bits).or_default().push((p.to_vec(), g));
    }

    pub fn is_empty(&self) -> bool {
        self.pack.is_empty()
    }

    /// Picks the size closest to `preferred` inside `[min, max]`, falling back
    /// to the nearest size outside the range.
    pub fn get_modulus(&self, min: u32, preferred: u32, max: u32) -> Result<Option<(BigNum, BigNum)>> {
        let in_range = self
            .pack
            .range(min..=max)
            .map(|(bits, _)| *bits)
            .min_by_key(|bits| (*bits < preferred, bits.abs_diff(preferred)));

        let bits = match in_range {
            Some(bits) => bits,
            None => {
                let below = self.pack.range(..min).next_back().map(|(bits, _)| *bits);
                let above = self.pack.range(max..).next().map(|(bits, _)| *bits);
                match (below, above) {
                    (Some(below), Some(above)) => {
                        if min - below <= above - max {
                            below
                        } else {
                            above
                        }
                    }
                    (Some(bits), None) | (None, Some(bits)) => bits,
                    (None, None) => return Ok(None),
                }
            }
        };

        let Some(entries) = self.pack.get(&bits) else {
            return Ok(None);
        };
        let mut pick = [0u8; 4];
        openssl::rand::rand_bytes(&mut pick)?;
        let (p, g) = &entries[u32::from_be_bytes(pick) as usize % entries.len()];
        Ok(Some((BigNum::from_slice(p)?, BigNum::from_u32(*g)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::sign::{self, PrivateKey};
    use openssl::{pkey::PKey, rsa::Rsa};

    fn host_key() -> Box<dyn PrivateKey> {
        sign::private_key_from_pkey(PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap())
            .unwrap()
    }

    fn run(name: &str) {
        let key = host_key();
        let moduli = ModulusPool::default();
        let client_ctx = KexContext {
            role: Role::Client,
            client_version: b"SSH-2.0-client",
            server_version: b"SSH-2.0-server",
            client_kexinit: b"client-init",
            server_kexinit: b"server-init",
            host_key: None,
            moduli: &moduli,
        };
        let server_ctx = KexContext {
            role: Role::Server,
            host_key: Some(key.as_ref()),
            ..client_ctx
        };

        let mut client = new_kex_by_name(name).unwrap().create();
        let mut server = new_kex_by_name(name).unwrap().create();

        let mut to_server = client.start(&client_ctx).unwrap().send;
        assert!(server.start(&server_ctx).unwrap().send.is_empty());

        let mut client_out = None;
        let mut server_out = None;
        while client_out.is_none() {
            let mut to_client = vec![];
            for msg in to_server.drain(..) {
                let step = server.on_packet(&server_ctx, &msg).unwrap();
                to_client.extend(step.send);
                if step.output.is_some() {
                    server_out = step.output;
                }
            }
            for msg in to_client {
                let step = client.on_packet(&client_ctx, &msg).unwrap();
                to_server.extend(step.send);
                if step.output.is_some() {
                    client_out = step.output;
                }
            }
        }

        let client_out = client_out.unwrap();
        let server_out = server_out.unwrap();
        assert_eq!(client_out.secret, server_out.secret);
        assert_eq!(client_out.exchange_hash, server_out.exchange_hash);
        assert_eq!(client_out.exchange_hash.len(), 20);
        assert_eq!(client_out.host_key, key.encode_public());

        let public = sign::decode_public_key(&client_out.host_key).unwrap();
        assert!(public.verify(&client_out.exchange_hash, &client_out.signature));
    }

    #[test]
    fn group1_agrees() {
        run("diffie-hellman-group1-sha1");
    }

    #[test]
    fn group14_agrees() {
        run("diffie-hellman-group14-sha1");
    }

    #[test]
    fn group_exchange_agrees() {
        run("diffie-hellman-group-exchange-sha1");
    }

    #[test]
    fn rejects_out_of_range_values() {
        let p = BigNum::get_rfc2409_prime_1024().unwrap();
        let one = BigNum::from_u32(1).unwrap();
        let two = BigNum::from_u32(2).unwrap();
        let mut p_minus_one = BigNum::new().unwrap();
        p_minus_one.checked_sub(&p, &one).unwrap();
        let mut p_minus_two = BigNum::new().unwrap();
        p_minus_two.checked_sub(&p, &two).unwrap();

        assert!(check_range(&one, &p).is_err());
        assert!(check_range(&p_minus_one, &p).is_err());
        assert!(check_range(&two, &p).is_ok());
        assert!(check_range(&p_minus_two, &p).is_ok());
    }

    #[test]
    fn modulus_pool_selection() {
        let pool = ModulusPool::default();
        let (p, g) = pool.get_modulus(1024, 2048, 8192).unwrap().unwrap();
        assert_eq!(p.num_bits(), 2048);
        assert_eq!(g, BigNum::from_u32(2).unwrap());

        let (p, _) = pool.get_modulus(512, 1024, 1536).unwrap().unwrap();
        assert_eq!(p.num_bits(), 1024);

        // nothing in range, nearest wins
        let (p, _) = pool.get_modulus(4096, 4096, 8192).unwrap().unwrap();
        assert_eq!(p.num_bits(), 2048);

        assert!(ModulusPool::empty()
            .get_modulus(1024, 2048, 8192)
            .unwrap()
            .is_none());
    }
}
