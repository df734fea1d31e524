//! The framing codec.
//!
//! `WireCodec` is the only component that knows where packets begin and
//! end. Decoding is incremental: bytes arrive in whatever segments the
//! transport produces, and a packet is surfaced only once its full
//! `5 + length` bytes are buffered. Nothing downstream ever reads the
//! socket directly.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{HEADER_SIZE, Packet, PacketType};

/// Framing failure. `Oversized` and `UnknownType` poison the connection;
/// `Io` is the transport dying underneath us.
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Oversized { declared: u32, ceiling: u32 },
    UnknownType(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Oversized { declared, ceiling } => {
                write!(f, "declared packet length {} exceeds ceiling {}", declared, ceiling)
            }
            Self::UnknownType(code) => write!(f, "unassigned packet type 0x{:02x}", code),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Length-prefix framer with a configurable per-packet ceiling.
#[derive(Debug, Clone)]
pub struct WireCodec {
    ceiling: u32,
}

impl WireCodec {
    pub fn new(ceiling: u32) -> WireCodec {
        WireCodec { ceiling }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }
}

impl Decoder for WireCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        // Loop so that reserved-range packets can be skipped in place.
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let code = src[0];
            let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
            if length > self.ceiling {
                return Err(FrameError::Oversized {
                    declared: length,
                    ceiling: self.ceiling,
                });
            }

            let total = HEADER_SIZE + length as usize;
            if src.len() < total {
                // Reserve the rest up front so reassembly stays O(1)
                // amortized per byte.
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(1);
            src.advance(4);
            let payload = src.split_to(length as usize).freeze();

            match PacketType::from_code(code) {
                Some(kind) => return Ok(Some(Packet { kind, payload })),
                None if PacketType::is_reserved(code) => continue,
                None => return Err(FrameError::UnknownType(code)),
            }
        }
    }

    /// Incomplete trailing bytes at EOF are discarded without error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), FrameError> {
        let length = packet.payload.len();
        if length as u64 > self.ceiling as u64 {
            return Err(FrameError::Oversized {
                declared: length as u32,
                ceiling: self.ceiling,
            });
        }
        dst.reserve(HEADER_SIZE + length);
        dst.put_u8(packet.kind.code());
        dst.put_u32(length as u32);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}
