//! Packet vocabulary for the Kakehashi wire.
//!
//! Every unit on the wire is a `(type, length, payload)` triple: one type
//! byte, a four byte big-endian length, then `length` payload bytes. The
//! payload is opaque at this layer; its grammar depends on the type.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::bootstrap::{Goodbye, GoodbyeReason};
use crate::status::{EndStatus, ErrorCode};

/// Bytes occupied by the type byte plus the length field.
pub const HEADER_SIZE: usize = 5;

/// Wire protocol revision carried in Hello/HelloAck.
pub const PROTOCOL_VERSION: u16 = 2;

/// Smallest receive window a peer may advertise.
pub const MIN_WINDOW: u32 = 16 * 1024;

/// Largest receive window a peer may advertise.
pub const MAX_WINDOW: u32 = 16 * 1024 * 1024;

/// Receive window advertised when the caller does not override it.
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// Packet-size ceiling for the legacy-side endpoint.
pub const NODE_MAX_PACKET: u32 = 1024 * 1024;

/// Packet-size ceiling for the relay endpoint.
pub const RELAY_MAX_PACKET: u32 = 16 * 1024 * 1024;

/// Longest path, in bytes, accepted in any operation metadata.
pub const MAX_PATH: usize = 4096;

/// First type code of the reserved range. Packets whose type falls in
/// `0x80..=0xFF` are skipped without comment; unassigned codes below it
/// are a protocol error.
pub const RESERVED_TYPE_BASE: u8 = 0x80;

/// The closed set of packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Hello,
    HelloAck,
    Ping,
    Pong,
    Goodbye,
    TerminalInput,
    TerminalOutput,
    TerminalResize,
    StreamOpen,
    StreamData,
    StreamEnd,
    StreamError,
    StreamCancel,
    WindowUpdate,
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Hello => 0x00,
            PacketType::HelloAck => 0x01,
            PacketType::Ping => 0x02,
            PacketType::Pong => 0x03,
            PacketType::Goodbye => 0x04,
            PacketType::TerminalInput => 0x10,
            PacketType::TerminalOutput => 0x11,
            PacketType::TerminalResize => 0x12,
            PacketType::StreamOpen => 0x20,
            PacketType::StreamData => 0x21,
            PacketType::StreamEnd => 0x22,
            PacketType::StreamError => 0x23,
            PacketType::StreamCancel => 0x24,
            PacketType::WindowUpdate => 0x30,
        }
    }

    pub fn from_code(code: u8) -> Option<PacketType> {
        match code {
            0x00 => Some(PacketType::Hello),
            0x01 => Some(PacketType::HelloAck),
            0x02 => Some(PacketType::Ping),
            0x03 => Some(PacketType::Pong),
            0x04 => Some(PacketType::Goodbye),
            0x10 => Some(PacketType::TerminalInput),
            0x11 => Some(PacketType::TerminalOutput),
            0x12 => Some(PacketType::TerminalResize),
            0x20 => Some(PacketType::StreamOpen),
            0x21 => Some(PacketType::StreamData),
            0x22 => Some(PacketType::StreamEnd),
            0x23 => Some(PacketType::StreamError),
            0x24 => Some(PacketType::StreamCancel),
            0x30 => Some(PacketType::WindowUpdate),
            _ => None,
        }
    }

    /// True for codes in the skip-silently range.
    pub fn is_reserved(code: u8) -> bool {
        code >= RESERVED_TYPE_BASE
    }

    /// True for the packet types that address a stream and therefore
    /// carry the four byte stream-id prefix in their payload.
    pub fn addresses_stream(self) -> bool {
        matches!(
            self,
            PacketType::StreamOpen
                | PacketType::StreamData
                | PacketType::StreamEnd
                | PacketType::StreamError
                | PacketType::StreamCancel
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Hello => "Hello",
            PacketType::HelloAck => "HelloAck",
            PacketType::Ping => "Ping",
            PacketType::Pong => "Pong",
            PacketType::Goodbye => "Goodbye",
            PacketType::TerminalInput => "TerminalInput",
            PacketType::TerminalOutput => "TerminalOutput",
            PacketType::TerminalResize => "TerminalResize",
            PacketType::StreamOpen => "StreamOpen",
            PacketType::StreamData => "StreamData",
            PacketType::StreamEnd => "StreamEnd",
            PacketType::StreamError => "StreamError",
            PacketType::StreamCancel => "StreamCancel",
            PacketType::WindowUpdate => "WindowUpdate",
        };
        f.write_str(name)
    }
}

/// One decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketType, payload: Bytes) -> Packet {
        Packet { kind, payload }
    }

    pub fn empty(kind: PacketType) -> Packet {
        Packet {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Payload bytes that count against the peer's credit window:
    /// stream data after the id prefix, and terminal bytes.
    pub fn flow_controlled_len(&self) -> usize {
        match self.kind {
            PacketType::StreamData => self.payload.len().saturating_sub(4),
            PacketType::TerminalInput | PacketType::TerminalOutput => self.payload.len(),
            _ => 0,
        }
    }

    pub fn ping(nonce: u64) -> Packet {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(nonce);
        Packet::new(PacketType::Ping, buf.freeze())
    }

    pub fn pong(nonce: u64) -> Packet {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(nonce);
        Packet::new(PacketType::Pong, buf.freeze())
    }

    pub fn goodbye(reason: GoodbyeReason, message: &str) -> Packet {
        Packet::new(PacketType::Goodbye, Goodbye::new(reason, message).encode())
    }

    pub fn terminal_input(data: Bytes) -> Packet {
        Packet::new(PacketType::TerminalInput, data)
    }

    pub fn terminal_output(data: Bytes) -> Packet {
        Packet::new(PacketType::TerminalOutput, data)
    }

    pub fn terminal_resize(cols: u16, rows: u16) -> Packet {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u16(cols);
        buf.put_u16(rows);
        Packet::new(PacketType::TerminalResize, buf.freeze())
    }

    pub fn stream_data(id: u32, data: &[u8]) -> Packet {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32(id);
        buf.put_slice(data);
        Packet::new(PacketType::StreamData, buf.freeze())
    }

    pub fn stream_end(id: u32, status: EndStatus, trailer: &[u8]) -> Packet {
        let mut buf = BytesMut::with_capacity(5 + trailer.len());
        buf.put_u32(id);
        buf.put_u8(status.code());
        buf.put_slice(trailer);
        Packet::new(PacketType::StreamEnd, buf.freeze())
    }

    pub fn stream_error(id: u32, code: ErrorCode, message: &str) -> Packet {
        let mut buf = BytesMut::with_capacity(6 + message.len());
        buf.put_u32(id);
        buf.put_u8(code.code());
        buf.put_slice(message.as_bytes());
        buf.put_u8(0);
        Packet::new(PacketType::StreamError, buf.freeze())
    }

    pub fn stream_cancel(id: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(id);
        Packet::new(PacketType::StreamCancel, buf.freeze())
    }

    pub fn window_update(increment: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(increment);
        Packet::new(PacketType::WindowUpdate, buf.freeze())
    }
}
