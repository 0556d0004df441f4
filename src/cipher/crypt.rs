use std::sync::OnceLock;

use super::*;
use crate::error::{Error, Result};
use derive_new::new;
use indexmap::IndexMap;
use openssl::{
    cipher::{Cipher, CipherRef},
    cipher_ctx::CipherCtx,
    provider::Provider,
};

algo_list!(
    encrypt_all,
    new_encrypt_all,
    new_encrypt_by_name,
    dyn Encrypt + Send,
    "aes128-ctr" => Evp::aes128_ctr(),
    "aes256-ctr" => Evp::aes256_ctr(),
    "aes128-cbc" => Evp::aes128_cbc(),
    "blowfish-cbc" => Evp::blowfish_cbc(),
    "aes256-cbc" => Evp::aes256_cbc(),
    "3des-cbc" => Evp::des_ede3_cbc(),
    "arcfour128" => Evp::arcfour128(),
    "arcfour256" => Evp::arcfour256(),
    "aes192-ctr" => Evp::aes192_ctr(),
    "aes192-cbc" => Evp::aes192_cbc(),
);

algo_list!(
    decrypt_all,
    new_decrypt_all,
    new_decrypt_by_name,
    dyn Decrypt + Send,
    "aes128-ctr" => Evp::aes128_ctr(),
    "aes256-ctr" => Evp::aes256_ctr(),
    "aes128-cbc" => Evp::aes128_cbc(),
    "blowfish-cbc" => Evp::blowfish_cbc(),
    "aes256-cbc" => Evp::aes256_cbc(),
    "3des-cbc" => Evp::des_ede3_cbc(),
    "arcfour128" => Evp::arcfour128(),
    "arcfour256" => Evp::arcfour256(),
    "aes192-ctr" => Evp::aes192_ctr(),
    "aes192-cbc" => Evp::aes192_cbc(),
);

pub trait Encrypt {
    fn name(&self) -> &str;
    fn block_size(&self) -> usize;
    fn iv_len(&self) -> usize;
    fn key_len(&self) -> usize;
    /// Stream and counter modes, which are padded with zeros.
    fn is_stream(&self) -> bool;

    fn initialize(&mut self, iv: &[u8], key: &[u8]) -> Result<()>;
    /// Encrypts `data` (a multiple of the block size) and appends it to `out`.
    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize>;
}

pub trait Decrypt {
    fn name(&self) -> &str;
    fn block_size(&self) -> usize;
    fn iv_len(&self) -> usize;
    fn key_len(&self) -> usize;

    fn initialize(&mut self, iv: &[u8], key: &[u8]) -> Result<()>;
    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize>;
}

/// Transport state before the first NEWKEYS.
pub fn none_encrypt() -> Box<dyn Encrypt + Send> {
    Box::new(Plain)
}

pub fn none_decrypt() -> Box<dyn Decrypt + Send> {
    Box::new(Plain)
}

struct Plain;

impl Encrypt for Plain {
    fn name(&self) -> &str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn iv_len(&self) -> usize {
        0
    }

    fn key_len(&self) -> usize {
        0
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn initialize(&mut self, _: &[u8], _: &[u8]) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        out.extend_from_slice(data);
        Ok(data.len())
    }
}

impl Decrypt for Plain {
    fn name(&self) -> &str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn iv_len(&self) -> usize {
        0
    }

    fn key_len(&self) -> usize {
        0
    }

    fn initialize(&mut self, _: &[u8], _: &[u8]) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        out.extend_from_slice(data);
        Ok(data.len())
    }
}

// blowfish and rc4 live in the legacy provider on openssl 3
fn load_legacy_provider() {
    static LEGACY: OnceLock<Option<Provider>> = OnceLock::new();
    LEGACY.get_or_init(|| match Provider::try_load(None, "legacy", true) {
        Ok(provider) => Some(provider),
        Err(err) => {
            tracing::debug!("legacy provider unavailable: {err}");
            None
        }
    });
}

#[derive(Clone, Copy, new)]
struct CipherArgs {
    cipher: &'static CipherRef,
    block_size: usize,
    key_len: usize,
    iv_len: usize,
    #[new(value = "false")]
    stream: bool,
    // keystream bytes thrown away after keying, RFC 4345
    #[new(value = "0")]
    discard: usize,
    #[new(value = "false")]
    legacy: bool,
}

impl CipherArgs {
    fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    fn discard(mut self, size: usize) -> Self {
        self.discard = size;
        self
    }
}

#[derive(new)]
struct Evp {
    name: &'static str,
    args: CipherArgs,
    #[new(default)]
    ctx: Option<CipherCtx>,
}

impl Evp {
    fn aes128_ctr() -> Self {
        Self::new(
            "aes128-ctr",
            CipherArgs::new(Cipher::aes_128_ctr(), 16, 16, 16).stream(),
        )
    }

    fn aes192_ctr() -> Self {
        Self::new(
            "aes192-ctr",
            CipherArgs::new(Cipher::aes_192_ctr(), 16, 24, 16).stream(),
        )
    }

    fn aes256_ctr() -> Self {
        Self::new(
            "aes256-ctr",
            CipherArgs::new(Cipher::aes_256_ctr(), 16, 32, 16).stream(),
        )
    }

    fn aes128_cbc() -> Self {
        Self::new("aes128-cbc", CipherArgs::new(Cipher::aes_128_cbc(), 16, 16, 16))
    }

    fn aes192_cbc() -> Self {
        Self::new("aes192-cbc", CipherArgs::new(Cipher::aes_192_cbc(), 16, 24, 16))
    }

    fn aes256_cbc() -> Self {
        Self::new("aes256-cbc", CipherArgs::new(Cipher::aes_256_cbc(), 16, 32, 16))
    }

    fn blowfish_cbc() -> Self {
        Self::new(
            "blowfish-cbc",
            CipherArgs::new(Cipher::bf_cbc(), 8, 16, 8).legacy(),
        )
    }

    fn des_ede3_cbc() -> Self {
        Self::new("3des-cbc", CipherArgs::new(Cipher::des_ede3_cbc(), 8, 24, 8))
    }

    fn arcfour128() -> Self {
        Self::new(
            "arcfour128",
            CipherArgs::new(Cipher::rc4(), 8, 16, 0)
                .stream()
                .legacy()
                .discard(1536),
        )
    }

    fn arcfour256() -> Self {
        Self::new(
            "arcfour256",
            CipherArgs::new(Cipher::rc4(), 8, 32, 0)
                .stream()
                .legacy()
                .discard(1536),
        )
    }

    fn get_ctx_mut(&mut self) -> Result<&mut CipherCtx> {
        self.ctx
            .as_mut()
            .ok_or_else(|| Error::ub("cipher is uninitialized"))
    }

    fn init(&mut self, encrypt: bool, iv: &[u8], key: &[u8]) -> Result<()> {
        if self.args.legacy {
            load_legacy_provider();
        }
        let key = key
            .get(..self.args.key_len)
            .ok_or_else(|| Error::invalid_argument("cipher key is too short"))?;
        let iv = if self.args.iv_len == 0 {
            None
        } else {
            Some(
                iv.get(..self.args.iv_len)
                    .ok_or_else(|| Error::invalid_argument("cipher iv is too short"))?,
            )
        };

        let mut ctx = CipherCtx::new()?;
        if encrypt {
            ctx.encrypt_init(Some(self.args.cipher), None, None)?;
        } else {
            ctx.decrypt_init(Some(self.args.cipher), None, None)?;
        }
        if ctx.key_length() != key.len() {
            ctx.set_key_length(key.len())?;
        }
        if encrypt {
            ctx.encrypt_init(None, Some(key), iv)?;
        } else {
            ctx.decrypt_init(None, Some(key), iv)?;
        }
        ctx.set_padding(false);

        if self.args.discard > 0 {
            let mut sink = vec![];
            ctx.cipher_update_vec(&vec![0; self.args.discard], &mut sink)?;
        }

        self.ctx = Some(ctx);
        Ok(())
    }
}

impl Encrypt for Evp {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        self.args.block_size
    }

    fn iv_len(&self) -> usize {
        self.args.iv_len
    }

    fn key_len(&self) -> usize {
        self.args.key_len
    }

    fn is_stream(&self) -> bool {
        self.args.stream
    }

    fn initialize(&mut self, iv: &[u8], key: &[u8]) -> Result<()> {
        self.init(true, iv, key)
    }

    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        Ok(self.get_ctx_mut()?.cipher_update_vec(data, out)?)
    }
}

impl Decrypt for Evp {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        self.args.block_size
    }

    fn iv_len(&self) -> usize {
        self.args.iv_len
    }

    fn key_len(&self) -> usize {
        self.args.key_len
    }

    fn initialize(&mut self, iv: &[u8], key: &[u8]) -> Result<()> {
        self.init(false, iv, key)
    }

    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        Ok(self.get_ctx_mut()?.cipher_update_vec(data, out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(name: &str) {
        let mut enc = new_encrypt_by_name(name).unwrap().create();
        let mut dec = new_decrypt_by_name(name).unwrap().create();
        let key: Vec<u8> = (0..enc.key_len() as u8).collect();
        let iv: Vec<u8> = (0..enc.iv_len() as u8).rev().collect();
        enc.initialize(&iv, &key).unwrap();
        dec.initialize(&iv, &key).unwrap();

        let block = enc.block_size();
        let first: Vec<u8> = (0..block * 3).map(|v| v as u8).collect();
        let second: Vec<u8> = (0..block * 2).map(|v| (v * 7) as u8).collect();

        let mut cipher = vec![];
        enc.update(&first, &mut cipher).unwrap();
        enc.update(&second, &mut cipher).unwrap();
        assert_ne!(&cipher[..first.len()], &first[..], "{name}");

        // decrypting in a different split must give the same plain text
        let mut plain = vec![];
        dec.update(&cipher[..block], &mut plain).unwrap();
        dec.update(&cipher[block..], &mut plain).unwrap();
        let mut expected = first.clone();
        expected.extend(second);
        assert_eq!(plain, expected, "{name}");
    }

    #[test]
    fn aes_and_3des_round_trip() {
        for name in [
            "aes128-ctr",
            "aes192-ctr",
            "aes256-ctr",
            "aes128-cbc",
            "aes192-cbc",
            "aes256-cbc",
            "3des-cbc",
        ] {
            round_trip(name);
        }
    }

    #[test]
    fn ctr_counter_starts_at_iv() {
        // NIST SP 800-38A F.5.1
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ];
        let iv = [
            0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd,
            0xfe, 0xff,
        ];
        let plain = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let mut enc = new_encrypt_by_name("aes128-ctr").unwrap().create();
        enc.initialize(&iv, &key).unwrap();
        let mut out = vec![];
        enc.update(&plain, &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26, 0x1b, 0xef, 0x68, 0x64, 0x99,
                0x0d, 0xb6, 0xce
            ]
        );
    }

    #[test]
    fn plain_is_identity() {
        let mut enc = none_encrypt();
        let mut out = vec![];
        enc.update(b"12345678", &mut out).unwrap();
        assert_eq!(out, b"12345678");
        assert!(enc.is_stream());
    }
}
