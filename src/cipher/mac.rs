use super::*;
use crate::error::{Error, Result};
use derive_new::new;
use indexmap::IndexMap;
use openssl::{
    md::{Md, MdRef},
    md_ctx::MdCtx,
    memcmp,
    pkey::{PKey, Private},
};

pub trait Mac {
    fn name(&self) -> &str;
    fn key_len(&self) -> usize;
    fn mac_len(&self) -> usize;
    fn initialize(&mut self, key: &[u8]) -> Result<()>;
    fn update(&mut self, data: &[u8]) -> Result<()>;
    fn finalize(&mut self) -> Result<Vec<u8>>;

    /// Finalizes and compares with `expected` in constant time.
    fn verify(&mut self, expected: &[u8]) -> Result<bool> {
        let calculated = self.finalize()?;
        Ok(calculated.len() == expected.len() && memcmp::eq(&calculated, expected))
    }
}

#[derive(new)]
pub struct HMac {
    name: &'static str,
    mac_len: usize,
    key_len: usize,
    digest: &'static MdRef,
    #[new(default)]
    ctx: Option<MdCtx>,
    #[new(default)]
    key: Option<PKey<Private>>,
}

impl HMac {
    fn get_ctx_mut(&mut self) -> Result<&mut MdCtx> {
        self.ctx.as_mut().ok_or_else(|| Error::ub("mac is uninitialized"))
    }
}

impl Mac for HMac {
    fn name(&self) -> &str {
        self.name
    }

    fn key_len(&self) -> usize {
        self.key_len
    }

    fn mac_len(&self) -> usize {
        self.mac_len
    }

    fn initialize(&mut self, key: &[u8]) -> Result<()> {
        let pkey = PKey::hmac(key)?;

        let mut ctx = MdCtx::new()?;
        ctx.digest_sign_init(Some(self.digest), &pkey)?;

        self.ctx = Some(ctx);
        self.key = Some(pkey);
        Ok(())
    }

    fn update(&mut self, data: &[u8]) -> Result<()> {
        self.get_ctx_mut()?.digest_sign_update(data)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let digest = self.digest;
        let mac_len = self.mac_len;
        let key = self
            .key
            .clone()
            .ok_or_else(|| Error::ub("mac is uninitialized"))?;
        let ctx = self.get_ctx_mut()?;

        let size = ctx.digest_sign_final(None)?;
        let mut buf = vec![0; size];
        ctx.digest_sign_final(Some(&mut buf))?;
        buf.truncate(mac_len);

        ctx.reset()?;
        ctx.digest_sign_init(Some(digest), &key)?;
        Ok(buf)
    }
}

algo_list!(
    all,
    new_all,
    new_mac_by_name,
    dyn Mac + Send,
    "hmac-sha1" => HMac::new("hmac-sha1", 20, 20, Md::sha1()),
    "hmac-md5" => HMac::new("hmac-md5", 16, 16, Md::md5()),
    "hmac-sha1-96" => HMac::new("hmac-sha1-96", 12, 20, Md::sha1()),
    "hmac-md5-96" => HMac::new("hmac-md5-96", 12, 16, Md::md5()),
    "hmac-sha2-256" => HMac::new("hmac-sha2-256", 32, 32, Md::sha256()),
    "hmac-sha2-512" => HMac::new("hmac-sha2-512", 64, 64, Md::sha512()),
);

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2202 test case 2
    #[test]
    fn hmac_sha1_known_answer() {
        let mut mac = new_mac_by_name("hmac-sha1").unwrap().create();
        mac.initialize(b"Jefe").unwrap();
        mac.update(b"what do ya want ").unwrap();
        mac.update(b"for nothing?").unwrap();
        let out = mac.finalize().unwrap();
        assert_eq!(
            out,
            vec![
                0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, 0x16, 0xd5, 0xf1,
                0x84, 0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79
            ]
        );

        // state resets after finalize
        mac.update(b"what do ya want for nothing?").unwrap();
        assert!(mac.verify(&out).unwrap());
    }

    #[test]
    fn truncated_variants() {
        for (name, len) in [
            ("hmac-sha1-96", 12),
            ("hmac-md5-96", 12),
            ("hmac-md5", 16),
            ("hmac-sha2-512", 64),
        ] {
            let mut mac = new_mac_by_name(name).unwrap().create();
            mac.initialize(&vec![7; mac.key_len()]).unwrap();
            mac.update(b"payload").unwrap();
            let out = mac.finalize().unwrap();
            assert_eq!(out.len(), len, "{name}");

            mac.update(b"payload").unwrap();
            let mut flipped = out.clone();
            flipped[0] ^= 1;
            assert!(!mac.verify(&flipped).unwrap(), "{name}");
        }
    }
}
