use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::BytesMut;
use openssl::rand::rand_bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::common::{PACKET_MAXIMUM_SIZE, REKEY_BYTES, REKEY_PACKETS};
use crate::{
    cipher::{
        compress::{none_decode, none_encode, Decode, Encode},
        crypt::{none_decrypt, none_encrypt, Decrypt, Encrypt},
        mac::Mac,
    },
    error::{Error, Result},
};

// longest identification or noise line we accept before the banner
const MAXIMUM_LINE_SIZE: usize = 1024;

pub struct BufferReader<R> {
    socket: R,
    r_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> BufferReader<R> {
    pub fn new(socket: R) -> Self {
        Self {
            socket,
            r_buf: BytesMut::new(),
        }
    }

    async fn internal_read(&mut self) -> io::Result<usize> {
        loop {
            match self.socket.read_buf(&mut self.r_buf).await {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    ))
                }
                Ok(size) => return Ok(size),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads one line ending in LF and returns it without the line ending.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut searched = 0;
        loop {
            if let Some(pos) = self.r_buf[searched..].iter().position(|&x| x == b'\n') {
                let mut line = self.r_buf.split_to(searched + pos + 1).to_vec();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            searched = self.r_buf.len();
            if searched > MAXIMUM_LINE_SIZE {
                return Err(Error::protocol("line too long before banner"));
            }
            self.internal_read().await?;
        }
    }

    pub async fn read_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        while self.r_buf.len() < size {
            self.internal_read().await?;
        }

        Ok(self.r_buf.split_to(size).to_vec())
    }

    fn take_buffered(&mut self, size: usize) -> Option<Vec<u8>> {
        (self.r_buf.len() >= size).then(|| self.r_buf.split_to(size).to_vec())
    }
}

/// When a direction asks for new keys, and how far past that the peer may
/// keep sending before we give up on it.
#[derive(Clone, Copy, Debug)]
pub struct RekeyLimits {
    pub bytes: u64,
    pub packets: u64,
    pub overflow_bytes: u64,
    pub overflow_packets: u64,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: REKEY_BYTES,
            packets: REKEY_PACKETS,
            overflow_bytes: REKEY_BYTES,
            overflow_packets: REKEY_PACKETS,
        }
    }
}

pub struct OutboundKeys {
    pub encrypt: Box<dyn Encrypt + Send>,
    pub mac: Option<Box<dyn Mac + Send>>,
    pub encode: Box<dyn Encode + Send>,
}

impl OutboundKeys {
    pub fn plain() -> Self {
        Self {
            encrypt: none_encrypt(),
            mac: None,
            encode: none_encode(),
        }
    }
}

pub struct InboundKeys {
    pub decrypt: Box<dyn Decrypt + Send>,
    pub mac: Option<Box<dyn Mac + Send>>,
    pub decode: Box<dyn Decode + Send>,
}

impl InboundKeys {
    pub fn plain() -> Self {
        Self {
            decrypt: none_decrypt(),
            mac: None,
            decode: none_decode(),
        }
    }
}

fn mac_input(mac: &mut dyn Mac, sequence: u32, packet: &[u8]) -> Result<()> {
    mac.update(&sequence.to_be_bytes())?;
    mac.update(packet)
}

/// Sending half of the binary packet protocol.
pub struct PacketWriter<W> {
    socket: W,
    keys: OutboundKeys,
    pub(crate) sequence_number: u32,
    sent_bytes: u64,
    sent_packets: u64,
    limits: RekeyLimits,
    authed: Arc<AtomicBool>,
    last_write: Instant,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(socket: W, limits: RekeyLimits, authed: Arc<AtomicBool>) -> Self {
        Self {
            socket,
            keys: OutboundKeys::plain(),
            sequence_number: 0,
            sent_bytes: 0,
            sent_packets: 0,
            limits,
            authed,
            last_write: Instant::now(),
        }
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.socket.write_all(data).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Builds the wire form of one packet and advances the outbound state.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed;
        let payload = if !self.keys.encode.delayed() || self.authed.load(Ordering::Acquire) {
            compressed = self.keys.encode.compress(payload)?;
            compressed.as_slice()
        } else {
            payload
        };

        let block_size = self.keys.encrypt.block_size().max(8);
        let mut padding_len = block_size - (4 + 1 + payload.len()) % block_size;
        if padding_len < 4 {
            padding_len += block_size;
        }
        let packet_len = 1 + payload.len() + padding_len;
        if packet_len + 4 > PACKET_MAXIMUM_SIZE {
            return Err(Error::ub("payload is too long"));
        }

        let mut packet = Vec::with_capacity(packet_len + 4 + 64);
        packet.extend_from_slice(&(packet_len as u32).to_be_bytes());
        packet.push(padding_len as u8);
        packet.extend_from_slice(payload);
        let start = packet.len();
        packet.resize(start + padding_len, 0);
        if !self.keys.encrypt.is_stream() {
            rand_bytes(&mut packet[start..])?;
        }

        let mut out = Vec::with_capacity(packet.len() + 64);
        self.keys.encrypt.update(&packet, &mut out)?;

        if let Some(mac) = self.keys.mac.as_mut() {
            mac_input(mac.as_mut(), self.sequence_number, &packet)?;
            out.extend(mac.finalize()?);
        }

        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.sent_bytes += out.len() as u64;
        self.sent_packets += 1;
        Ok(out)
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let packet = self.seal(payload)?;
        self.socket.write_all(&packet).await?;
        self.socket.flush().await?;
        self.last_write = Instant::now();
        Ok(())
    }

    pub fn need_rekey(&self) -> bool {
        self.sent_bytes >= self.limits.bytes || self.sent_packets >= self.limits.packets
    }

    pub fn install(&mut self, keys: OutboundKeys) {
        tracing::trace!(
            "outbound keys installed: {} after {} bytes",
            keys.encrypt.name(),
            self.sent_bytes
        );
        self.keys = keys;
        self.sent_bytes = 0;
        self.sent_packets = 0;
    }

    pub fn idle_since(&self) -> Instant {
        self.last_write
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.socket.shutdown().await?;
        Ok(())
    }
}

/// Receiving half of the binary packet protocol.
pub struct PacketReader<R> {
    stream: BufferReader<R>,
    keys: InboundKeys,
    pub(crate) sequence_number: u32,
    received_bytes: u64,
    received_packets: u64,
    overflow_bytes: u64,
    overflow_packets: u64,
    rekey_requested: bool,
    limits: RekeyLimits,
    authed: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(stream: BufferReader<R>, limits: RekeyLimits, authed: Arc<AtomicBool>) -> Self {
        Self {
            stream,
            keys: InboundKeys::plain(),
            sequence_number: 0,
            received_bytes: 0,
            received_packets: 0,
            overflow_bytes: 0,
            overflow_packets: 0,
            rekey_requested: false,
            limits,
            authed,
        }
    }

    pub fn install(&mut self, keys: InboundKeys) {
        tracing::trace!(
            "inbound keys installed: {} after {} bytes",
            keys.decrypt.name(),
            self.received_bytes
        );
        self.keys = keys;
        self.received_bytes = 0;
        self.received_packets = 0;
        self.overflow_bytes = 0;
        self.overflow_packets = 0;
        self.rekey_requested = false;
    }

    /// True exactly once per key set, when the inbound counters pass the
    /// rekey threshold.
    pub fn take_rekey_request(&mut self) -> bool {
        if self.rekey_requested {
            return false;
        }
        if self.received_bytes >= self.limits.bytes || self.received_packets >= self.limits.packets
        {
            self.rekey_requested = true;
            return true;
        }
        false
    }

    /// Reads, decrypts and verifies one packet, returning its sequence
    /// number and payload.
    pub async fn recv(&mut self) -> Result<(u32, Vec<u8>)> {
        let block_size = self.keys.decrypt.block_size().max(8);

        let first = self.stream.read_exact(block_size).await?;
        let mut packet = Vec::with_capacity(PACKET_MAXIMUM_SIZE);
        self.keys.decrypt.update(&first, &mut packet)?;

        let packet_len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        if packet_len < 5
            || packet_len + 4 > PACKET_MAXIMUM_SIZE
            || (packet_len + 4) % block_size != 0
        {
            return Err(Error::protocol(format!("invalid packet length: {packet_len}")));
        }

        let left = packet_len + 4 - block_size;
        let mac_len = self.keys.mac.as_ref().map_or(0, |mac| mac.mac_len());
        let rest = match self.stream.take_buffered(left + mac_len) {
            Some(rest) => rest,
            None => self.stream.read_exact(left + mac_len).await?,
        };
        self.keys.decrypt.update(&rest[..left], &mut packet)?;

        if let Some(mac) = self.keys.mac.as_mut() {
            mac_input(mac.as_mut(), self.sequence_number, &packet)?;
            if !mac.verify(&rest[left..])? {
                return Err(Error::MacVerificationFailed);
            }
        }

        let padding_len = packet[4] as usize;
        if padding_len + 1 > packet_len {
            return Err(Error::protocol(format!("invalid padding length: {padding_len}")));
        }
        let payload = &packet[5..4 + packet_len - padding_len];
        let payload = if !self.keys.decode.delayed() || self.authed.load(Ordering::Acquire) {
            self.keys.decode.decompress(payload)?
        } else {
            payload.to_vec()
        };

        let sequence = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let wire = (packet_len + 4 + mac_len) as u64;
        self.received_bytes += wire;
        self.received_packets += 1;
        if self.rekey_requested {
            self.overflow_bytes += wire;
            self.overflow_packets += 1;
            if self.overflow_bytes > self.limits.overflow_bytes
                || self.overflow_packets > self.limits.overflow_packets
            {
                return Err(Error::protocol("remote transport is ignoring rekey requests"));
            }
        }

        Ok((sequence, payload))
    }
}
