//! Handshake and farewell payloads.
//!
//! The dialing side (the legacy endpoint) speaks first with Hello; the
//! accepting side answers with HelloAck. Hello additionally announces the
//! dialer's working directory, against which the operation handlers
//! resolve relative paths. Both directions advertise a receive window,
//! which must sit inside `[MIN_WINDOW, MAX_WINDOW]`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::packet::{MAX_PATH, MAX_WINDOW, MIN_WINDOW};

/// Session flag bits carried in Hello/HelloAck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionFlags {
    bits: u16,
}

impl SessionFlags {
    pub const RESUME: u16 = 0x0001;
    pub const SIMPLE: u16 = 0x0002;

    pub fn new() -> SessionFlags {
        SessionFlags { bits: 0 }
    }

    pub fn from_bits(bits: u16) -> SessionFlags {
        SessionFlags { bits }
    }

    pub fn bits(self) -> u16 {
        self.bits
    }

    pub fn with_resume(mut self) -> SessionFlags {
        self.bits |= Self::RESUME;
        self
    }

    pub fn with_simple(mut self) -> SessionFlags {
        self.bits |= Self::SIMPLE;
        self
    }

    pub fn resume(self) -> bool {
        self.bits & Self::RESUME != 0
    }

    pub fn simple(self) -> bool {
        self.bits & Self::SIMPLE != 0
    }
}

/// Read `count` bytes off the front of `input`, or fail.
pub(crate) fn take<'a>(input: &mut &'a [u8], count: usize) -> Result<&'a [u8]> {
    if input.len() < count {
        return Err(WireError::Truncated);
    }
    let (head, rest) = input.split_at(count);
    *input = rest;
    Ok(head)
}

pub(crate) fn take_u8(input: &mut &[u8]) -> Result<u8> {
    Ok(take(input, 1)?[0])
}

pub(crate) fn take_u16(input: &mut &[u8]) -> Result<u16> {
    let raw = take(input, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

pub(crate) fn take_u32(input: &mut &[u8]) -> Result<u32> {
    let raw = take(input, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn take_u64(input: &mut &[u8]) -> Result<u64> {
    let raw = take(input, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(raw);
    Ok(u64::from_be_bytes(arr))
}

/// Read a NUL-terminated byte string, consuming the terminator.
pub(crate) fn take_cstr<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    match input.iter().position(|&b| b == 0) {
        Some(nul) => {
            let value = &input[..nul];
            *input = &input[nul + 1..];
            Ok(value)
        }
        None => Err(WireError::UnterminatedString),
    }
}

/// Append a byte string plus its NUL terminator, refusing embedded NULs.
pub(crate) fn put_cstr(buf: &mut BytesMut, value: &[u8]) {
    debug_assert!(!value.contains(&0));
    buf.put_slice(value);
    buf.put_u8(0);
}

/// Validate a path field: non-empty, no embedded NUL, bounded length.
pub(crate) fn check_path(path: &[u8]) -> Result<()> {
    if path.is_empty() || path.len() > MAX_PATH || path.contains(&0) {
        return Err(WireError::BadPath);
    }
    Ok(())
}

fn check_window(window: u32) -> Result<u32> {
    if !(MIN_WINDOW..=MAX_WINDOW).contains(&window) {
        return Err(WireError::WindowOutOfRange(window));
    }
    Ok(window)
}

/// The dialer's opening announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub flags: SessionFlags,
    pub window: u32,
    pub cwd: Vec<u8>,
}

impl Hello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.cwd.len());
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.window);
        put_cstr(&mut buf, &self.cwd);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Hello> {
        let mut input = payload;
        let version = take_u16(&mut input)?;
        let flags = SessionFlags::from_bits(take_u16(&mut input)?);
        let window = check_window(take_u32(&mut input)?)?;
        let cwd = take_cstr(&mut input)?;
        check_path(cwd)?;
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(Hello {
            version,
            flags,
            window,
            cwd: cwd.to_vec(),
        })
    }
}

/// The acceptor's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    pub version: u16,
    pub flags: SessionFlags,
    pub window: u32,
}

impl HelloAck {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.window);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<HelloAck> {
        let mut input = payload;
        let version = take_u16(&mut input)?;
        let flags = SessionFlags::from_bits(take_u16(&mut input)?);
        let window = check_window(take_u32(&mut input)?)?;
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(HelloAck {
            version,
            flags,
            window,
        })
    }
}

/// Why a side is hanging up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodbyeReason {
    Normal,
    ProtocolError,
    VersionMismatch,
    Shutdown,
    Timeout,
}

impl GoodbyeReason {
    pub fn code(self) -> u8 {
        match self {
            GoodbyeReason::Normal => 0,
            GoodbyeReason::ProtocolError => 1,
            GoodbyeReason::VersionMismatch => 2,
            GoodbyeReason::Shutdown => 3,
            GoodbyeReason::Timeout => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<GoodbyeReason> {
        match code {
            0 => Some(GoodbyeReason::Normal),
            1 => Some(GoodbyeReason::ProtocolError),
            2 => Some(GoodbyeReason::VersionMismatch),
            3 => Some(GoodbyeReason::Shutdown),
            4 => Some(GoodbyeReason::Timeout),
            _ => None,
        }
    }

    /// Whether a session ending with this reason counts as a clean exit.
    pub fn is_orderly(self) -> bool {
        matches!(self, GoodbyeReason::Normal | GoodbyeReason::Shutdown)
    }
}

impl fmt::Display for GoodbyeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoodbyeReason::Normal => write!(f, "normal"),
            GoodbyeReason::ProtocolError => write!(f, "protocol error"),
            GoodbyeReason::VersionMismatch => write!(f, "version mismatch"),
            GoodbyeReason::Shutdown => write!(f, "shutdown"),
            GoodbyeReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// Farewell payload: a reason byte plus a short human-readable note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub reason: GoodbyeReason,
    pub message: String,
}

impl Goodbye {
    pub fn new(reason: GoodbyeReason, message: &str) -> Goodbye {
        Goodbye {
            reason,
            message: message.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.message.len());
        buf.put_u8(self.reason.code());
        buf.put_slice(self.message.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    /// An empty payload is tolerated and reads as a plain Normal goodbye;
    /// a missing terminator on the message likewise.
    pub fn decode(payload: &[u8]) -> Result<Goodbye> {
        if payload.is_empty() {
            return Ok(Goodbye::new(GoodbyeReason::Normal, ""));
        }
        let mut input = payload;
        let reason =
            GoodbyeReason::from_code(take_u8(&mut input)?).ok_or(WireError::UnknownCode(payload[0]))?;
        let message = match input.iter().position(|&b| b == 0) {
            Some(nul) => &input[..nul],
            None => input,
        };
        Ok(Goodbye {
            reason,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

/// Ping and Pong carry an opaque nonce the reply must echo.
pub fn decode_nonce(payload: &[u8]) -> Result<u64> {
    let mut input = payload;
    let nonce = take_u64(&mut input)?;
    if !input.is_empty() {
        return Err(WireError::TrailingBytes);
    }
    Ok(nonce)
}

/// Terminal geometry carried in TerminalResize.
pub fn decode_resize(payload: &[u8]) -> Result<(u16, u16)> {
    let mut input = payload;
    let cols = take_u16(&mut input)?;
    let rows = take_u16(&mut input)?;
    if !input.is_empty() {
        return Err(WireError::TrailingBytes);
    }
    Ok((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let flags = SessionFlags::new().with_resume().with_simple();
        assert!(flags.resume());
        assert!(flags.simple());
        let back = SessionFlags::from_bits(flags.bits());
        assert_eq!(back, flags);
        assert!(!SessionFlags::new().resume());
    }

    #[test]
    fn hello_window_out_of_range() {
        let mut hello = Hello {
            version: 2,
            flags: SessionFlags::new(),
            window: 1024,
            cwd: b"/tmp".to_vec(),
        };
        assert_eq!(
            Hello::decode(&hello.encode()),
            Err(WireError::WindowOutOfRange(1024))
        );

        hello.window = 64 * 1024 * 1024;
        assert!(matches!(
            Hello::decode(&hello.encode()),
            Err(WireError::WindowOutOfRange(_))
        ));
    }

    #[test]
    fn hello_rejects_trailing_bytes() {
        let hello = Hello {
            version: 2,
            flags: SessionFlags::new(),
            window: 65536,
            cwd: b"/srv".to_vec(),
        };
        let mut raw = hello.encode().to_vec();
        raw.push(0xaa);
        assert_eq!(Hello::decode(&raw), Err(WireError::TrailingBytes));
    }

    #[test]
    fn goodbye_lenient_decode() {
        // An empty payload and an unterminated message both still parse.
        assert_eq!(
            Goodbye::decode(&[]).unwrap().reason,
            GoodbyeReason::Normal
        );
        let parsed = Goodbye::decode(b"\x03bye").unwrap();
        assert_eq!(parsed.reason, GoodbyeReason::Shutdown);
        assert_eq!(parsed.message, "bye");
    }

    #[test]
    fn truncated_fields() {
        assert_eq!(HelloAck::decode(&[0, 2, 0]), Err(WireError::Truncated));
        assert_eq!(decode_nonce(&[1, 2, 3]), Err(WireError::Truncated));
        assert_eq!(decode_resize(&[0, 80]), Err(WireError::Truncated));
    }
}
