//! Stream termination statuses and the structured error taxonomy.
//!
//! These are wire codes, not language error types: a handler reports a
//! failure by putting one of these bytes in a StreamError packet, and the
//! connection itself stays healthy.

use std::fmt;

/// How a stream ended, carried in StreamEnd.
///
/// `Ok` and `Cancelled` apply to every kind; the remaining variants
/// classify a child process exit and are produced by Execute only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    Ok,
    Cancelled,
    NormalExit,
    KilledBySignal,
    TimedOut,
    Unknown,
}

impl EndStatus {
    pub fn code(self) -> u8 {
        match self {
            EndStatus::Ok => 0,
            EndStatus::Cancelled => 1,
            EndStatus::NormalExit => 2,
            EndStatus::KilledBySignal => 3,
            EndStatus::TimedOut => 4,
            EndStatus::Unknown => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<EndStatus> {
        match code {
            0 => Some(EndStatus::Ok),
            1 => Some(EndStatus::Cancelled),
            2 => Some(EndStatus::NormalExit),
            3 => Some(EndStatus::KilledBySignal),
            4 => Some(EndStatus::TimedOut),
            5 => Some(EndStatus::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for EndStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndStatus::Ok => write!(f, "ok"),
            EndStatus::Cancelled => write!(f, "cancelled"),
            EndStatus::NormalExit => write!(f, "exited"),
            EndStatus::KilledBySignal => write!(f, "killed by signal"),
            EndStatus::TimedOut => write!(f, "timed out"),
            EndStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Why a stream failed, carried in StreamError.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    NotFound,
    Permission,
    IoError,
    Timeout,
    Cancelled,
    NoResources,
    Invalid,
    Exists,
    NotDir,
    IsDir,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::Unknown => 0,
            ErrorCode::NotFound => 1,
            ErrorCode::Permission => 2,
            ErrorCode::IoError => 3,
            ErrorCode::Timeout => 4,
            ErrorCode::Cancelled => 5,
            ErrorCode::NoResources => 6,
            ErrorCode::Invalid => 7,
            ErrorCode::Exists => 8,
            ErrorCode::NotDir => 9,
            ErrorCode::IsDir => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<ErrorCode> {
        match code {
            0 => Some(ErrorCode::Unknown),
            1 => Some(ErrorCode::NotFound),
            2 => Some(ErrorCode::Permission),
            3 => Some(ErrorCode::IoError),
            4 => Some(ErrorCode::Timeout),
            5 => Some(ErrorCode::Cancelled),
            6 => Some(ErrorCode::NoResources),
            7 => Some(ErrorCode::Invalid),
            8 => Some(ErrorCode::Exists),
            9 => Some(ErrorCode::NotDir),
            10 => Some(ErrorCode::IsDir),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unknown => write!(f, "unknown error"),
            ErrorCode::NotFound => write!(f, "not found"),
            ErrorCode::Permission => write!(f, "permission denied"),
            ErrorCode::IoError => write!(f, "I/O error"),
            ErrorCode::Timeout => write!(f, "timed out"),
            ErrorCode::Cancelled => write!(f, "cancelled"),
            ErrorCode::NoResources => write!(f, "no resources"),
            ErrorCode::Invalid => write!(f, "invalid request"),
            ErrorCode::Exists => write!(f, "already exists"),
            ErrorCode::NotDir => write!(f, "not a directory"),
            ErrorCode::IsDir => write!(f, "is a directory"),
        }
    }
}
