use std::fmt;

/// Failure while decoding a payload grammar. Framing failures are
/// `codec::FrameError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Payload ended before the field being read.
    Truncated,
    /// A NUL-terminated string field was missing its terminator.
    UnterminatedString,
    /// A path field carried an embedded NUL or exceeded the path bound.
    BadPath,
    /// Payload carried bytes past the last defined field.
    TrailingBytes,
    /// A discriminant byte outside its enumeration.
    UnknownCode(u8),
    /// An advertised receive window outside the legal range.
    WindowOutOfRange(u32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "payload truncated"),
            Self::UnterminatedString => write!(f, "string field missing NUL terminator"),
            Self::BadPath => write!(f, "path field malformed or too long"),
            Self::TrailingBytes => write!(f, "payload carries trailing bytes"),
            Self::UnknownCode(c) => write!(f, "unknown discriminant 0x{:02x}", c),
            Self::WindowOutOfRange(w) => write!(f, "advertised window {} outside legal range", w),
        }
    }
}

impl std::error::Error for WireError {}

pub type Result<T> = std::result::Result<T, WireError>;
