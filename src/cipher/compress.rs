use super::*;
use crate::error::{builder, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use indexmap::IndexMap;

algo_list!(
    encode_all,
    new_encode_all,
    new_encode_by_name,
    dyn Encode + Send,
    "none" => Never,
    "zlib" => ZEncoder::new(false),
    "zlib@openssh.com" => ZEncoder::new(true),
);

algo_list!(
    decode_all,
    new_decode_all,
    new_decode_by_name,
    dyn Decode + Send,
    "none" => Never,
    "zlib" => ZDecoder::new(false),
    "zlib@openssh.com" => ZDecoder::new(true),
);

pub fn none_encode() -> Box<dyn Encode + Send> {
    Box::new(Never)
}

pub fn none_decode() -> Box<dyn Decode + Send> {
    Box::new(Never)
}

pub trait Encode {
    fn name(&self) -> &str;
    /// Only active once the user is authenticated.
    fn delayed(&self) -> bool;
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

pub trait Decode {
    fn name(&self) -> &str;
    fn delayed(&self) -> bool;
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

struct Never;

impl Encode for Never {
    fn name(&self) -> &str {
        "none"
    }

    fn delayed(&self) -> bool {
        false
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl Decode for Never {
    fn name(&self) -> &str {
        "none"
    }

    fn delayed(&self) -> bool {
        false
    }

    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

struct ZEncoder {
    delayed: bool,
    encoder: Compress,
}

impl ZEncoder {
    fn new(delayed: bool) -> Self {
        Self {
            delayed,
            encoder: Compress::new(Compression::default(), true),
        }
    }
}

impl Encode for ZEncoder {
    fn name(&self) -> &str {
        if self.delayed {
            "zlib@openssh.com"
        } else {
            "zlib"
        }
    }

    fn delayed(&self) -> bool {
        self.delayed
    }

    // every packet ends with a partial flush so the peer can inflate it alone
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let start = self.encoder.total_in();
        let mut out = Vec::with_capacity(data.len() + 64);
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(1024);
            }
            let consumed = (self.encoder.total_in() - start) as usize;
            if self
                .encoder
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Partial)
                .is_err()
            {
                return builder::Compress.fail();
            }
            let consumed = (self.encoder.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

struct ZDecoder {
    delayed: bool,
    decoder: Decompress,
}

impl ZDecoder {
    fn new(delayed: bool) -> Self {
        Self {
            delayed,
            decoder: Decompress::new(true),
        }
    }
}

impl Decode for ZDecoder {
    fn name(&self) -> &str {
        if self.delayed {
            "zlib@openssh.com"
        } else {
            "zlib"
        }
    }

    fn delayed(&self) -> bool {
        self.delayed
    }

    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let start = self.decoder.total_in();
        let mut out = Vec::with_capacity(data.len() * 4 + 64);
        loop {
            if out.capacity() - out.len() < 1024 {
                out.reserve(out.capacity().max(4096));
            }
            let consumed_before = (self.decoder.total_in() - start) as usize;
            let produced_before = out.len();
            let status = match self.decoder.decompress_vec(
                &data[consumed_before..],
                &mut out,
                FlushDecompress::Sync,
            ) {
                Ok(status) => status,
                Err(_) => return builder::Compress.fail(),
            };
            let consumed = (self.decoder.total_in() - start) as usize;
            let finished = consumed == data.len() && out.len() < out.capacity();
            let stalled = consumed == consumed_before && out.len() == produced_before;
            match status {
                Status::StreamEnd => return Ok(out),
                _ if finished => return Ok(out),
                Status::BufError | Status::Ok if stalled => {
                    if consumed == data.len() {
                        return Ok(out);
                    }
                    return builder::Compress.fail();
                }
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_stream_across_packets() {
        let mut enc = new_encode_by_name("zlib").unwrap().create();
        let mut dec = new_decode_by_name("zlib").unwrap().create();
        assert!(!enc.delayed());

        let mut payloads = vec![b"hello hello hello hello".to_vec(), vec![0u8; 100_000]];
        payloads.push((0..50_000u32).flat_map(|v| v.to_be_bytes()).collect());
        payloads.push(vec![]);

        for payload in payloads {
            let compressed = enc.compress(&payload).unwrap();
            assert_eq!(dec.decompress(&compressed).unwrap(), payload);
        }
    }

    #[test]
    fn delayed_flag() {
        assert!(new_encode_by_name("zlib@openssh.com")
            .unwrap()
            .create()
            .delayed());
        assert!(new_decode_by_name("zlib@openssh.com")
            .unwrap()
            .create()
            .delayed());
        assert_eq!(none_encode().compress(b"abc").unwrap(), b"abc");
    }
}
