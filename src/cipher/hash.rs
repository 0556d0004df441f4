use openssl::{
    md::{Md, MdRef},
    md_ctx::MdCtx,
};

use crate::error::Result;

pub trait Hash {
    fn hash_len(&self) -> usize;
    fn update(&mut self, data: &[u8]) -> Result<()>;
    /// Returns the digest and resets the state for reuse.
    fn finalize(&mut self) -> Result<Vec<u8>>;
}

pub(crate) struct MdWrapper {
    ctx: MdCtx,
    md: &'static MdRef,
}

impl MdWrapper {
    pub fn initialize(md: &'static MdRef) -> Result<MdWrapper> {
        let mut ctx = MdCtx::new()?;
        ctx.digest_init(md)?;
        Ok(MdWrapper { ctx, md })
    }

    pub fn sha1() -> Result<MdWrapper> {
        Self::initialize(Md::sha1())
    }

    pub fn md5() -> Result<MdWrapper> {
        Self::initialize(Md::md5())
    }

    /// One-shot digest of `data`.
    pub fn digest(md: &'static MdRef, data: &[u8]) -> Result<Vec<u8>> {
        let mut wrapper = Self::initialize(md)?;
        wrapper.update(data)?;
        wrapper.finalize()
    }
}

impl Hash for MdWrapper {
    fn hash_len(&self) -> usize {
        self.md.size()
    }

    fn update(&mut self, data: &[u8]) -> Result<()> {
        self.ctx.digest_update(data)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![0; self.md.size()];
        self.ctx.digest_final(&mut out)?;
        self.ctx.digest_init(self.md)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_answer_and_reuse() {
        let mut hash = MdWrapper::sha1().unwrap();
        hash.update(b"abc").unwrap();
        let first = hash.finalize().unwrap();
        assert_eq!(
            first,
            vec![
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
        hash.update(b"abc").unwrap();
        assert_eq!(hash.finalize().unwrap(), first);
        assert_eq!(hash.hash_len(), 20);
    }
}
