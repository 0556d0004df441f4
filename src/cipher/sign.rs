use openssl::{
    bn::{BigNum, BigNumContext},
    dsa::{Dsa, DsaSig},
    ec::{EcGroup, EcKey, EcPoint, PointConversionForm},
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    md::{Md, MdRef},
    memcmp,
    nid::Nid,
    pkey::{HasPublic, PKey, Private, Public},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
    sign::{Signer, Verifier},
};

use crate::{
    cipher::hash::MdWrapper,
    error::{Error, Result},
    ssh::buffer::{BigNumExt, Buffer},
};

macro_rules! invalid_key_format {
    () => {
        Error::malformed_key(format!("{}:{} invalid key format", file!(), line!()))
    };
}

/// Host key algorithms in preference order.
pub fn all() -> &'static [&'static str] {
    &[
        "ssh-rsa",
        "ssh-dss",
        "ecdsa-sha2-nistp256",
        "ecdsa-sha2-nistp384",
        "ecdsa-sha2-nistp521",
    ]
}

pub trait PublicKey: Send + Sync {
    fn name(&self) -> &str;
    /// Checks an ssh signature blob (`string type || string signature`).
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
    /// The public key blob as sent on the wire.
    fn encode_public(&self) -> Vec<u8>;

    fn fingerprint(&self) -> Result<Vec<u8>> {
        MdWrapper::digest(Md::md5(), &self.encode_public())
    }

    /// Constant time comparison of the wire forms.
    fn same_key(&self, other: &dyn PublicKey) -> bool {
        let ours = self.encode_public();
        let theirs = other.encode_public();
        self.name() == other.name() && ours.len() == theirs.len() && memcmp::eq(&ours, &theirs)
    }
}

pub trait PrivateKey: PublicKey {
    /// Signs `data` and returns the ssh signature blob.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn public_key(&self) -> Box<dyn PublicKey>;
}

/// Parses a public key blob.
pub fn decode_public_key(blob: &[u8]) -> Result<Box<dyn PublicKey>> {
    let buffer = Buffer::from_slice(blob);
    let keytype = buffer.take_str().ok_or_else(|| invalid_key_format!())?;
    match keytype {
        "ssh-rsa" => {
            let e = buffer.take_mpint().ok_or_else(|| invalid_key_format!())?;
            let n = buffer.take_mpint().ok_or_else(|| invalid_key_format!())?;
            let rsa = Rsa::from_public_components(n, e)?;
            Ok(Box::new(RsaKey::new(PKey::from_rsa(rsa)?)))
        }
        "ssh-dss" => {
            let take = || buffer.take_mpint().ok_or_else(|| invalid_key_format!());
            let (p, q, g, y) = (take()?, take()?, take()?, take()?);
            let dsa = Dsa::from_public_components(p, q, g, y)?;
            Ok(Box::new(DsaKey::new(PKey::from_dsa(dsa)?)))
        }
        name if name.starts_with("ecdsa-sha2-") => {
            let (nid, _) = curve_by_name(name)?;
            let curve = buffer.take_str().ok_or_else(|| invalid_key_format!())?;
            if !name.ends_with(curve) {
                return Err(invalid_key_format!());
            }
            let point = buffer.take_one().ok_or_else(|| invalid_key_format!())?.1;
            let group = EcGroup::from_curve_name(nid)?;
            let mut bnctx = BigNumContext::new()?;
            let point = EcPoint::from_bytes(&group, point, &mut bnctx)?;
            let key = EcKey::from_public_key(&group, &point)?;
            key.check_key()?;
            Ok(Box::new(EcdsaKey::new(PKey::from_ec_key(key)?)?))
        }
        other => Err(Error::malformed_key(format!("unsupported key type: {other}"))),
    }
}

fn curve_by_name(name: &str) -> Result<(Nid, &'static MdRef)> {
    match name {
        "ecdsa-sha2-nistp256" => Ok((Nid::X9_62_PRIME256V1, Md::sha256())),
        "ecdsa-sha2-nistp384" => Ok((Nid::SECP384R1, Md::sha384())),
        "ecdsa-sha2-nistp521" => Ok((Nid::SECP521R1, Md::sha512())),
        other => Err(Error::malformed_key(format!("unsupported curve: {other}"))),
    }
}

fn curve_by_nid(nid: Nid) -> Result<(&'static str, &'static MdRef)> {
    match nid {
        Nid::X9_62_PRIME256V1 => Ok(("ecdsa-sha2-nistp256", Md::sha256())),
        Nid::SECP384R1 => Ok(("ecdsa-sha2-nistp384", Md::sha384())),
        Nid::SECP521R1 => Ok(("ecdsa-sha2-nistp521", Md::sha512())),
        _ => Err(Error::malformed_key("unsupported curve")),
    }
}

/// Splits a signature blob, checking its declared type.
fn signature_body(expect: &str, signature: &[u8]) -> Option<Vec<u8>> {
    let buffer = Buffer::from_slice(signature);
    let signtype = buffer.take_str()?;
    if signtype != expect {
        return None;
    }
    Some(buffer.take_one()?.1.to_vec())
}

fn signature_blob(name: &str, body: &[u8]) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_one(name);
    buffer.put_one(body);
    buffer.into_vec()
}

pub struct RsaKey<T> {
    key: PKey<T>,
}

impl<T> RsaKey<T> {
    pub fn new(key: PKey<T>) -> Self {
        Self { key }
    }
}

impl<T: HasPublic> PublicKey for RsaKey<T>
where
    RsaKey<T>: Send + Sync,
{
    fn name(&self) -> &str {
        "ssh-rsa"
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(body) = signature_body("ssh-rsa", signature) else {
            return false;
        };
        let verify = || -> Result<bool> {
            let hash = MdWrapper::digest(Md::sha1(), data)?;
            let mut ctx = PkeyCtx::new(&self.key)?;
            ctx.verify_init()?;
            ctx.set_rsa_padding(Padding::PKCS1)?;
            ctx.set_signature_md(Md::sha1())?;
            Ok(ctx.verify(&hash, &body).unwrap_or(false))
        };
        verify().unwrap_or(false)
    }

    fn encode_public(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.put_one("ssh-rsa");
        if let Ok(rsa) = self.key.rsa() {
            buffer.put_mpint(rsa.e());
            buffer.put_mpint(rsa.n());
        }
        buffer.into_vec()
    }
}

impl PrivateKey for RsaKey<Private> {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let hash = MdWrapper::digest(Md::sha1(), data)?;
        let mut ctx = PkeyCtx::new(&self.key)?;
        ctx.sign_init()?;
        ctx.set_rsa_padding(Padding::PKCS1)?;
        ctx.set_signature_md(Md::sha1())?;
        let mut out = vec![];
        ctx.sign_to_vec(&hash, &mut out)?;
        Ok(signature_blob("ssh-rsa", &out))
    }

    fn public_key(&self) -> Box<dyn PublicKey> {
        Box::new(RsaKey::new(self.key.clone()))
    }
}

pub struct DsaKey<T> {
    key: PKey<T>,
}

impl<T> DsaKey<T> {
    pub fn new(key: PKey<T>) -> Self {
        Self { key }
    }
}

impl<T: HasPublic> PublicKey for DsaKey<T>
where
    DsaKey<T>: Send + Sync,
{
    fn name(&self) -> &str {
        "ssh-dss"
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(body) = signature_body("ssh-dss", signature) else {
            return false;
        };
        if body.len() != 40 {
            return false;
        }
        let verify = || -> Result<bool> {
            let r = BigNum::from_slice(&body[..20])?;
            let s = BigNum::from_slice(&body[20..])?;
            let der = DsaSig::from_private_components(r, s)?.to_der()?;
            let mut verifier = Verifier::new(MessageDigest::sha1(), &self.key)?;
            verifier.update(data)?;
            Ok(verifier.verify(&der).unwrap_or(false))
        };
        verify().unwrap_or(false)
    }

    fn encode_public(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.put_one("ssh-dss");
        if let Ok(dsa) = self.key.dsa() {
            buffer.put_mpint(dsa.p());
            buffer.put_mpint(dsa.q());
            buffer.put_mpint(dsa.g());
            buffer.put_mpint(dsa.pub_key());
        }
        buffer.into_vec()
    }
}

impl PrivateKey for DsaKey<Private> {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha1(), &self.key)?;
        signer.update(data)?;
        let der = signer.sign_to_vec()?;
        let sig = DsaSig::from_der(&der)?;

        // r and s as two 160 bit big endian integers
        let mut body = vec![0u8; 40];
        let r = sig.r().to_vec();
        let s = sig.s().to_vec();
        if r.len() > 20 || s.len() > 20 {
            return Err(Error::ub("dsa signature component exceeds 160 bits"));
        }
        body[20 - r.len()..20].copy_from_slice(&r);
        body[40 - s.len()..].copy_from_slice(&s);
        Ok(signature_blob("ssh-dss", &body))
    }

    fn public_key(&self) -> Box<dyn PublicKey> {
        Box::new(DsaKey::new(self.key.clone()))
    }
}

pub struct EcdsaKey<T> {
    name: &'static str,
    hash: &'static MdRef,
    key: PKey<T>,
}

impl<T: HasPublic> EcdsaKey<T> {
    pub fn new(key: PKey<T>) -> Result<Self> {
        let nid = key
            .ec_key()?
            .group()
            .curve_name()
            .ok_or_else(|| Error::malformed_key("unnamed curve"))?;
        let (name, hash) = curve_by_nid(nid)?;
        Ok(Self { name, hash, key })
    }
}

impl<T: HasPublic> PublicKey for EcdsaKey<T>
where
    EcdsaKey<T>: Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(body) = signature_body(self.name, signature) else {
            return false;
        };
        let verify = || -> Result<bool> {
            let body = Buffer::from_slice(&body);
            let r = body.take_mpint().ok_or_else(|| invalid_key_format!())?;
            let s = body.take_mpint().ok_or_else(|| invalid_key_format!())?;
            let sig = EcdsaSig::from_private_components(r, s)?;
            let hash = MdWrapper::digest(self.hash, data)?;
            let ec = self.key.ec_key()?;
            Ok(sig.verify(&hash, &ec).unwrap_or(false))
        };
        verify().unwrap_or(false)
    }

    fn encode_public(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.put_one(self.name);
        buffer.put_one(self.name.trim_start_matches("ecdsa-sha2-"));
        let point = || -> Result<Vec<u8>> {
            let ec = self.key.ec_key()?;
            let mut bnctx = BigNumContext::new()?;
            Ok(ec
                .public_key()
                .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut bnctx)?)
        };
        buffer.put_one(point().unwrap_or_default());
        buffer.into_vec()
    }
}

impl PrivateKey for EcdsaKey<Private> {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let hash = MdWrapper::digest(self.hash, data)?;
        let ec = self.key.ec_key()?;
        let sig = EcdsaSig::sign(&hash, &ec)?;

        let mut body = Buffer::new();
        body.put_one(sig.r().to_ssh_bytes());
        body.put_one(sig.s().to_ssh_bytes());
        Ok(signature_blob(self.name, body.as_ref()))
    }

    fn public_key(&self) -> Box<dyn PublicKey> {
        let public = || -> Result<Box<dyn PublicKey>> {
            let ec = self.key.ec_key()?;
            let public = EcKey::from_public_key(ec.group(), ec.public_key())?;
            Ok(Box::new(EcdsaKey::<Public>::new(PKey::from_ec_key(public)?)?))
        };
        match public() {
            Ok(key) => key,
            Err(_) => Box::new(EcdsaKey {
                name: self.name,
                hash: self.hash,
                key: self.key.clone(),
            }),
        }
    }
}

/// Wraps an openssl private key in the matching ssh key type.
pub fn private_key_from_pkey(pkey: PKey<Private>) -> Result<Box<dyn PrivateKey>> {
    match pkey.id() {
        openssl::pkey::Id::RSA => Ok(Box::new(RsaKey::new(pkey))),
        openssl::pkey::Id::DSA => {
            // ssh-dss signatures carry r and s in 20 bytes each
            if pkey.dsa()?.q().num_bits() != 160 {
                return Err(Error::malformed_key("ssh-dss needs a 160 bit q"));
            }
            Ok(Box::new(DsaKey::new(pkey)))
        }
        openssl::pkey::Id::EC => Ok(Box::new(EcdsaKey::new(pkey)?)),
        _ => Err(Error::malformed_key("unsupported private key type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa() -> Box<dyn PrivateKey> {
        private_key_from_pkey(PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap()).unwrap()
    }

    fn dsa() -> Box<dyn PrivateKey> {
        private_key_from_pkey(PKey::from_dsa(Dsa::generate(1024).unwrap()).unwrap()).unwrap()
    }

    fn ecdsa() -> Box<dyn PrivateKey> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        private_key_from_pkey(PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap())
            .unwrap()
    }

    #[test]
    fn dsa_with_wide_q_is_refused() {
        let dsa = Dsa::generate(2048).unwrap();
        assert_ne!(dsa.q().num_bits(), 160);
        let res = private_key_from_pkey(PKey::from_dsa(dsa).unwrap());
        assert!(matches!(res, Err(Error::MalformedKey { .. })));
    }

    #[test]
    fn sign_and_verify_through_wire_blob() {
        for key in [rsa(), dsa(), ecdsa()] {
            let sig = key.sign(b"exchange hash").unwrap();
            let public = decode_public_key(&key.encode_public()).unwrap();
            assert_eq!(public.name(), key.name());
            assert!(public.verify(b"exchange hash", &sig), "{}", key.name());
            assert!(!public.verify(b"exchange hasH", &sig), "{}", key.name());
            assert!(public.same_key(key.public_key().as_ref()));
            assert_eq!(public.encode_public(), key.encode_public());
        }
    }

    #[test]
    fn dss_signature_is_forty_bytes() {
        let key = dsa();
        let sig = key.sign(b"data").unwrap();
        let body = signature_body("ssh-dss", &sig).unwrap();
        assert_eq!(body.len(), 40);
    }

    #[test]
    fn mismatched_signature_type_fails() {
        let key = rsa();
        let other = ecdsa();
        let sig = other.sign(b"data").unwrap();
        assert!(!key.verify(b"data", &sig));
        assert!(!key.same_key(other.public_key().as_ref()));
        assert!(decode_public_key(b"\x00\x00\x00\x03abc").is_err());
    }
}
