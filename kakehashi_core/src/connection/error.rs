use std::fmt;
use std::io;

use kakehashi_wire::codec::FrameError;
use kakehashi_wire::{GoodbyeReason, WireError};

#[derive(Debug)]
pub enum ConnectionError {
    IoError(io::Error),
    Frame(FrameError),
    Payload(WireError),
    HandshakeTimeout,
    FirstPacketNotHello(u8),
    UnsupportedProtocolVersion(u16),
    WindowOutOfRange(u32),
    CreditOverflow,
    KeepaliveTimeout,
    ConnectionClosed,
    ProtocolViolation(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(err) => write!(f, "I/O error: {}", err),
            Self::Frame(err) => write!(f, "framing error: {}", err),
            Self::Payload(err) => write!(f, "payload error: {}", err),
            Self::HandshakeTimeout => write!(f, "handshake timed out"),
            Self::FirstPacketNotHello(code) => {
                write!(f, "first packet has type 0x{:02x}, expected Hello", code)
            }
            Self::UnsupportedProtocolVersion(v) => {
                write!(f, "unsupported protocol version {}", v)
            }
            Self::WindowOutOfRange(w) => write!(f, "peer advertised illegal window {}", w),
            Self::CreditOverflow => write!(f, "peer credited more bytes than were in flight"),
            Self::KeepaliveTimeout => write!(f, "peer stopped answering pings"),
            Self::ConnectionClosed => write!(f, "connection closed unexpectedly"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => Self::IoError(io),
            other => Self::Frame(other),
        }
    }
}

impl From<WireError> for ConnectionError {
    fn from(err: WireError) -> Self {
        Self::Payload(err)
    }
}

impl ConnectionError {
    /// The farewell reason this failure maps onto, when a Goodbye can
    /// still be written before closing.
    pub fn goodbye_reason(&self) -> GoodbyeReason {
        match self {
            Self::UnsupportedProtocolVersion(_) => GoodbyeReason::VersionMismatch,
            Self::HandshakeTimeout | Self::KeepaliveTimeout => GoodbyeReason::Timeout,
            Self::IoError(_) | Self::ConnectionClosed => GoodbyeReason::Normal,
            _ => GoodbyeReason::ProtocolError,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
