use std::{
    cell::Cell,
    mem::size_of,
    ops::{Index, IndexMut},
    slice::SliceIndex,
};

use bytes::{Buf, BufMut};
use openssl::bn::{BigNum, BigNumRef};

/// Wire codec for the ssh primitive types.
///
/// Writing appends to the owned storage. Reading consumes from an internal
/// cursor, so a buffer can be parsed through a shared reference.
/// Every `take_*` returns `None` on truncated input and leaves the cursor
/// where it was.
#[derive(Default, Clone, Debug)]
pub struct Buffer<T = Vec<u8>> {
    inner: T,
    pos: Cell<usize>,
}

pub trait BigNumExt {
    /// The content of an mpint for a non negative number.
    fn to_ssh_bytes(&self) -> Vec<u8>;
}

impl BigNumExt for BigNumRef {
    fn to_ssh_bytes(&self) -> Vec<u8> {
        encode_mpint(self)
    }
}

impl From<Buffer> for Vec<u8> {
    fn from(value: Buffer) -> Self {
        value.into_vec()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Self::from_vec(value)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Buffer<T> {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_ref()
    }
}

impl<I: SliceIndex<[u8]>> Index<I> for Buffer {
    type Output = I::Output;

    #[inline]
    fn index(&self, index: I) -> &Self::Output {
        &self.inner[index]
    }
}

impl<I: SliceIndex<[u8]>> IndexMut<I> for Buffer {
    fn index_mut(&mut self, index: I) -> &mut Self::Output {
        &mut self.inner[index]
    }
}

impl Buffer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_vec(Vec::with_capacity(capacity))
    }

    pub fn from_vec(vec: Vec<u8>) -> Self {
        Self {
            inner: vec,
            pos: Cell::new(0),
        }
    }

    /// A buffer holding `content` as a single ssh string.
    pub fn from_one(content: impl AsRef<[u8]>) -> Self {
        let content = content.as_ref();
        let mut buffer = Self::with_capacity(content.len() + size_of::<u32>());
        buffer.put_one(content);
        buffer
    }

    pub fn put_u64(&mut self, num: u64) {
        self.inner.put_u64(num);
    }

    pub fn put_u32(&mut self, num: u32) {
        self.inner.put_u32(num);
    }

    pub fn put_u8(&mut self, num: u8) {
        self.inner.put_u8(num);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.inner.put_u8(value as u8);
    }

    pub fn put_bytes(&mut self, bytes: impl AsRef<[u8]>) {
        self.inner.extend_from_slice(bytes.as_ref());
    }

    /// string: u32 length followed by the bytes
    pub fn put_one(&mut self, content: impl AsRef<[u8]>) {
        let content = content.as_ref();
        self.put_u32(content.len() as u32);
        self.put_bytes(content);
    }

    pub fn put_mpint(&mut self, num: &BigNumRef) {
        self.put_one(encode_mpint(num));
    }

    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|v| v.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_one(joined);
    }

    pub fn extend<I: IntoIterator<Item = u8>>(&mut self, other: I) {
        self.inner.extend(other);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.inner
    }

    pub fn clear(&mut self) {
        self.inner.clear();
        self.pos.set(0);
    }
}

impl<'a> Buffer<&'a [u8]> {
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self {
            inner: data,
            pos: Cell::new(0),
        }
    }
}

impl<T: AsRef<[u8]>> Buffer<T> {
    pub fn len(&self) -> usize {
        self.inner.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &[u8] {
        &self.inner.as_ref()[self.pos.get()..]
    }

    pub fn left(&self) -> usize {
        self.len() - self.pos.get()
    }

    fn advance(&self, size: usize) {
        self.pos.set(self.pos.get() + size);
    }

    pub fn take_u8(&self) -> Option<u8> {
        let value = *self.remaining().first()?;
        self.advance(1);
        Some(value)
    }

    pub fn take_bool(&self) -> Option<bool> {
        self.take_u8().map(|v| v != 0)
    }

    pub fn take_u32(&self) -> Option<u32> {
        let mut rest = self.remaining();
        if rest.len() < size_of::<u32>() {
            return None;
        }
        let num = rest.get_u32();
        self.advance(size_of::<u32>());
        Some(num)
    }

    pub fn take_u64(&self) -> Option<u64> {
        let mut rest = self.remaining();
        if rest.len() < size_of::<u64>() {
            return None;
        }
        let num = rest.get_u64();
        self.advance(size_of::<u64>());
        Some(num)
    }

    pub fn take_bytes(&self, size: usize) -> Option<&[u8]> {
        let start = self.pos.get();
        if self.left() < size {
            return None;
        }
        self.advance(size);
        Some(&self.inner.as_ref()[start..start + size])
    }

    pub fn take_one(&self) -> Option<(u32, &[u8])> {
        let start = self.pos.get();
        let size = self.take_u32()?;
        match self.take_bytes(size as usize) {
            Some(bytes) => Some((size, bytes)),
            None => {
                self.pos.set(start);
                None
            }
        }
    }

    pub fn take_str(&self) -> Option<&str> {
        let start = self.pos.get();
        let (_, bytes) = self.take_one()?;
        match std::str::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                self.pos.set(start);
                None
            }
        }
    }

    pub fn take_string(&self) -> Option<String> {
        self.take_one()
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
    }

    pub fn take_mpint(&self) -> Option<BigNum> {
        let start = self.pos.get();
        let (_, bytes) = self.take_one()?;
        let num = decode_mpint(bytes);
        if num.is_none() {
            self.pos.set(start);
        }
        num
    }

    pub fn take_name_list(&self) -> Option<Vec<String>> {
        let list = self.take_str()?;
        Some(split_name_list(list))
    }
}

fn split_name_list(list: &str) -> Vec<String> {
    if list.is_empty() {
        return vec![];
    }
    list.split(',').map(|v| v.to_string()).collect()
}

/// Shortest two's complement big endian form. Zero is the empty string.
pub fn encode_mpint(num: &BigNumRef) -> Vec<u8> {
    let magnitude = num.to_vec();
    if magnitude.is_empty() {
        return vec![];
    }
    if !num.is_negative() {
        let mut out = Vec::with_capacity(magnitude.len() + 1);
        if magnitude[0] & 0x80 != 0 {
            out.push(0);
        }
        out.extend(magnitude);
        return out;
    }

    let mut out = twos_complement(&magnitude);
    if out[0] & 0x80 == 0 {
        out.insert(0, 0xff);
    }
    out
}

pub fn decode_mpint(bytes: &[u8]) -> Option<BigNum> {
    if bytes.is_empty() {
        return BigNum::new().ok();
    }
    if bytes[0] & 0x80 == 0 {
        return BigNum::from_slice(bytes).ok();
    }
    let magnitude = twos_complement(bytes);
    let mut num = BigNum::from_slice(&magnitude).ok()?;
    num.set_negative(true);
    Some(num)
}

// invert and add one
fn twos_complement(bytes: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = bytes.iter().map(|v| !v).collect();
    for byte in out.iter_mut().rev() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bn(value: i64) -> BigNum {
        let mut num = BigNum::from_slice(&value.unsigned_abs().to_be_bytes()).unwrap();
        num.set_negative(value < 0);
        num
    }

    fn power(k: i32, offset: i32, negative: bool) -> BigNum {
        let one = BigNum::from_u32(1).unwrap();
        let mut num = BigNum::new().unwrap();
        num.lshift(&one, k).unwrap();
        let delta = BigNum::from_u32(offset.unsigned_abs()).unwrap();
        let mut out = BigNum::new().unwrap();
        if offset < 0 {
            out.checked_sub(&num, &delta).unwrap();
        } else {
            out.checked_add(&num, &delta).unwrap();
        }
        out.set_negative(negative);
        out
    }

    #[test]
    fn mpint_known_vectors() {
        assert_eq!(encode_mpint(&bn(0)), Vec::<u8>::new());
        assert_eq!(encode_mpint(&bn(1)), vec![1]);
        assert_eq!(encode_mpint(&bn(-1)), vec![0xff]);
        assert_eq!(encode_mpint(&bn(0x80)), vec![0, 0x80]);
        assert_eq!(encode_mpint(&bn(-0x80)), vec![0x80]);
        assert_eq!(encode_mpint(&bn(-0x81)), vec![0xff, 0x7f]);
        assert_eq!(encode_mpint(&bn(0x1234)), vec![0x12, 0x34]);
        assert_eq!(encode_mpint(&bn(-0x1234)), vec![0xed, 0xcc]);
        assert_eq!(encode_mpint(&bn(-0xdeadbeef)), vec![0xff, 0x21, 0x52, 0x41, 0x11]);

        let big = BigNum::from_hex_str("9a378f9b2e332a7").unwrap();
        assert_eq!(
            encode_mpint(&big),
            vec![0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
    }

    #[test]
    fn mpint_boundaries_round_trip() {
        for k in [7, 8, 15, 16, 31, 32, 63, 64, 127, 128] {
            for offset in [-1, 0, 1] {
                for negative in [false, true] {
                    let num = power(k, offset, negative);
                    let encoded = encode_mpint(&num);
                    let decoded = decode_mpint(&encoded).unwrap();
                    assert_eq!(decoded, num, "k={k} offset={offset} negative={negative}");

                    // minimal: dropping the first byte must change the value or the sign
                    if encoded.len() > 1 {
                        let first = encoded[0];
                        let second = encoded[1];
                        assert!(
                            !(first == 0 && second & 0x80 == 0)
                                && !(first == 0xff && second & 0x80 != 0),
                            "k={k} offset={offset} negative={negative} not minimal"
                        );
                    }
                    assert_eq!(encoded.first().map(|v| v & 0x80 != 0), Some(negative));
                }
            }
        }
    }

    #[test]
    fn strict_reads() {
        let mut buffer = Buffer::new();
        buffer.put_u8(7);
        buffer.put_one("hello");
        buffer.put_name_list(&["a", "b,c"]);
        buffer.put_u32(3);

        let parse = Buffer::from_slice(buffer.as_ref());
        assert_eq!(parse.take_u8(), Some(7));
        assert_eq!(parse.take_str(), Some("hello"));
        assert_eq!(
            parse.take_name_list().unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(parse.take_u32(), Some(3));
        assert_eq!(parse.take_u8(), None);
        assert_eq!(parse.take_u32(), None);

        let truncated = Buffer::from_slice(&[0, 0, 0, 10, b'a', b'b']);
        assert_eq!(truncated.take_one(), None);
        assert_eq!(truncated.left(), 6);

        let short = Buffer::from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(short.take_u64(), None);
        assert_eq!(short.take_u32(), Some(0x01020304));
    }

    #[test]
    fn wide_mpint_keeps_every_byte() {
        // nine significant bytes, wider than any machine integer
        let mut buffer = Buffer::new();
        buffer.put_one([0x01, 0, 0, 0, 0, 0, 0, 0, 0x02]);
        let parse = Buffer::from_slice(buffer.as_ref());
        let num = parse.take_mpint().unwrap();
        assert_eq!(num.num_bits(), 65);
        assert_eq!(parse.left(), 0);
    }

    #[test]
    fn malformed_input_never_panics() {
        let data = [0xffu8, 0xff, 0xff, 0xff, 0x00, 0x01];
        let parse = Buffer::from_slice(&data);
        assert_eq!(parse.take_one(), None);
        assert_eq!(parse.take_name_list(), None);
        assert_eq!(parse.take_mpint(), None);
        assert_eq!(parse.take_u32(), Some(0xffffffff));
        assert_eq!(parse.take_u64(), None);
        assert_eq!(parse.left(), 2);
    }
}
