//! Native UDP audio packet codec
//!
//! Layout (big-endian, 28-byte header):
//!
//! ```text
//! magic u32 | sequence u32 | timestamp_us u64 | sample_rate u32 |
//! channels u16 | frame_size u16 | payload_len u32 | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// "WSA1"
pub const PACKET_MAGIC: u32 = 0x5753_4131;

pub const HEADER_LEN: usize = 28;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("invalid payload length {declared} (datagram carries {available})")]
    BadLength { declared: u32, available: usize },
}

/// PCM stream format carried in every packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel
    pub frame_size: u16,
}

impl PacketFormat {
    /// Bytes of 16-bit PCM in one frame
    pub fn frame_bytes(&self) -> usize {
        self.frame_size as usize * self.channels as usize * 2
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub format: PacketFormat,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(PACKET_MAGIC);
        buf.put_u32(self.sequence);
        buf.put_u64(self.timestamp_us);
        buf.put_u32(self.format.sample_rate);
        buf.put_u16(self.format.channels);
        buf.put_u16(self.format.frame_size);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::TooShort(datagram.len()));
        }

        let mut buf = datagram;
        let magic = buf.get_u32();
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic(magic));
        }
        let sequence = buf.get_u32();
        let timestamp_us = buf.get_u64();
        let sample_rate = buf.get_u32();
        let channels = buf.get_u16();
        let frame_size = buf.get_u16();
        let declared = buf.get_u32();

        let available = buf.remaining();
        if declared < 1 || declared as usize > available {
            return Err(PacketError::BadLength {
                declared,
                available,
            });
        }

        Ok(Self {
            sequence,
            timestamp_us,
            format: PacketFormat {
                sample_rate,
                channels,
                frame_size,
            },
            payload: Bytes::copy_from_slice(&buf[..declared as usize]),
        })
    }
}
