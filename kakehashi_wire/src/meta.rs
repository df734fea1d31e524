//! Operation metadata and reply layouts.
//!
//! A StreamOpen payload is `id u32, kind u8, metadata`, where the
//! metadata grammar depends on the kind. Paths and other strings are
//! NUL-terminated raw bytes in the filesystem's native encoding; nothing
//! here assumes UTF-8.

use bytes::{BufMut, Bytes, BytesMut};

use crate::bootstrap::{check_path, put_cstr, take_cstr, take_u32, take_u64, take_u8};
use crate::error::{Result, WireError};
use crate::packet::{Packet, PacketType};
use crate::status::{EndStatus, ErrorCode};

/// The closed vocabulary of stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    FileRead,
    FileWrite,
    Stat,
    Lstat,
    Exists,
    MakeDir,
    Remove,
    Move,
    ResolvePath,
    ListDir,
    GlobFind,
    Search,
    Execute,
}

impl OperationKind {
    pub fn code(self) -> u8 {
        match self {
            OperationKind::FileRead => 1,
            OperationKind::FileWrite => 2,
            OperationKind::Stat => 3,
            OperationKind::Lstat => 4,
            OperationKind::Exists => 5,
            OperationKind::MakeDir => 6,
            OperationKind::Remove => 7,
            OperationKind::Move => 8,
            OperationKind::ResolvePath => 9,
            OperationKind::ListDir => 10,
            OperationKind::GlobFind => 11,
            OperationKind::Search => 12,
            OperationKind::Execute => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<OperationKind> {
        match code {
            1 => Some(OperationKind::FileRead),
            2 => Some(OperationKind::FileWrite),
            3 => Some(OperationKind::Stat),
            4 => Some(OperationKind::Lstat),
            5 => Some(OperationKind::Exists),
            6 => Some(OperationKind::MakeDir),
            7 => Some(OperationKind::Remove),
            8 => Some(OperationKind::Move),
            9 => Some(OperationKind::ResolvePath),
            10 => Some(OperationKind::ListDir),
            11 => Some(OperationKind::GlobFind),
            12 => Some(OperationKind::Search),
            13 => Some(OperationKind::Execute),
            _ => None,
        }
    }

    /// Whether the opener sends a body after Open. Only file writes do;
    /// every other kind is fully described by its metadata, so the
    /// opener's half of the stream is closed the moment it opens.
    pub fn has_request_body(self) -> bool {
        matches!(self, OperationKind::FileWrite)
    }
}

/// A parsed StreamOpen request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRequest {
    FileRead { path: Vec<u8> },
    FileWrite { path: Vec<u8>, mode: u32 },
    Stat { path: Vec<u8> },
    Lstat { path: Vec<u8> },
    Exists { path: Vec<u8> },
    MakeDir { path: Vec<u8> },
    Remove { path: Vec<u8> },
    Move { src: Vec<u8>, dst: Vec<u8> },
    ResolvePath { path: Vec<u8> },
    ListDir { path: Vec<u8> },
    GlobFind { base: Vec<u8>, pattern: Vec<u8> },
    Search { base: Vec<u8>, needle: Vec<u8>, file_pattern: Option<Vec<u8>> },
    Execute { command: Vec<u8> },
}

impl OpenRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OpenRequest::FileRead { .. } => OperationKind::FileRead,
            OpenRequest::FileWrite { .. } => OperationKind::FileWrite,
            OpenRequest::Stat { .. } => OperationKind::Stat,
            OpenRequest::Lstat { .. } => OperationKind::Lstat,
            OpenRequest::Exists { .. } => OperationKind::Exists,
            OpenRequest::MakeDir { .. } => OperationKind::MakeDir,
            OpenRequest::Remove { .. } => OperationKind::Remove,
            OpenRequest::Move { .. } => OperationKind::Move,
            OpenRequest::ResolvePath { .. } => OperationKind::ResolvePath,
            OpenRequest::ListDir { .. } => OperationKind::ListDir,
            OpenRequest::GlobFind { .. } => OperationKind::GlobFind,
            OpenRequest::Search { .. } => OperationKind::Search,
            OpenRequest::Execute { .. } => OperationKind::Execute,
        }
    }

    /// Build the complete StreamOpen packet for stream `id`.
    pub fn open_packet(&self, id: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(id);
        buf.put_u8(self.kind().code());
        match self {
            OpenRequest::FileRead { path }
            | OpenRequest::Stat { path }
            | OpenRequest::Lstat { path }
            | OpenRequest::Exists { path }
            | OpenRequest::MakeDir { path }
            | OpenRequest::Remove { path }
            | OpenRequest::ResolvePath { path }
            | OpenRequest::ListDir { path } => {
                put_cstr(&mut buf, path);
            }
            OpenRequest::FileWrite { path, mode } => {
                put_cstr(&mut buf, path);
                buf.put_u32(*mode);
            }
            OpenRequest::Move { src, dst } => {
                put_cstr(&mut buf, src);
                put_cstr(&mut buf, dst);
            }
            OpenRequest::GlobFind { base, pattern } => {
                put_cstr(&mut buf, base);
                put_cstr(&mut buf, pattern);
            }
            OpenRequest::Search { base, needle, file_pattern } => {
                put_cstr(&mut buf, base);
                put_cstr(&mut buf, needle);
                if let Some(fp) = file_pattern {
                    put_cstr(&mut buf, fp);
                }
            }
            OpenRequest::Execute { command } => {
                put_cstr(&mut buf, command);
            }
        }
        Packet::new(PacketType::StreamOpen, buf.freeze())
    }

    /// Parse the metadata that follows the kind byte.
    pub fn parse(kind: OperationKind, metadata: &[u8]) -> Result<OpenRequest> {
        let mut input = metadata;
        let request = match kind {
            OperationKind::FileRead => OpenRequest::FileRead {
                path: take_path(&mut input)?,
            },
            OperationKind::FileWrite => {
                let path = take_path(&mut input)?;
                let mode = take_u32(&mut input)?;
                OpenRequest::FileWrite { path, mode }
            }
            OperationKind::Stat => OpenRequest::Stat {
                path: take_path(&mut input)?,
            },
            OperationKind::Lstat => OpenRequest::Lstat {
                path: take_path(&mut input)?,
            },
            OperationKind::Exists => OpenRequest::Exists {
                path: take_path(&mut input)?,
            },
            OperationKind::MakeDir => OpenRequest::MakeDir {
                path: take_path(&mut input)?,
            },
            OperationKind::Remove => OpenRequest::Remove {
                path: take_path(&mut input)?,
            },
            OperationKind::Move => {
                let src = take_path(&mut input)?;
                let dst = take_path(&mut input)?;
                OpenRequest::Move { src, dst }
            }
            OperationKind::ResolvePath => OpenRequest::ResolvePath {
                path: take_path(&mut input)?,
            },
            OperationKind::ListDir => OpenRequest::ListDir {
                path: take_path(&mut input)?,
            },
            OperationKind::GlobFind => {
                let base = take_path(&mut input)?;
                let pattern = take_cstr(&mut input)?.to_vec();
                if pattern.is_empty() {
                    return Err(WireError::Truncated);
                }
                OpenRequest::GlobFind { base, pattern }
            }
            OperationKind::Search => {
                let base = take_path(&mut input)?;
                let needle = take_cstr(&mut input)?.to_vec();
                if needle.is_empty() {
                    return Err(WireError::Truncated);
                }
                let file_pattern = if input.is_empty() {
                    None
                } else {
                    Some(take_cstr(&mut input)?.to_vec())
                };
                OpenRequest::Search { base, needle, file_pattern }
            }
            OperationKind::Execute => {
                let command = take_cstr(&mut input)?.to_vec();
                if command.is_empty() {
                    return Err(WireError::Truncated);
                }
                OpenRequest::Execute { command }
            }
        };
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(request)
    }
}

fn take_path(input: &mut &[u8]) -> Result<Vec<u8>> {
    let raw = take_cstr(input)?;
    check_path(raw)?;
    Ok(raw.to_vec())
}

/// Split the four byte stream-id prefix off a stream packet payload.
pub fn split_stream_id(payload: &Bytes) -> Result<(u32, Bytes)> {
    if payload.len() < 4 {
        return Err(WireError::Truncated);
    }
    let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((id, payload.slice(4..)))
}

/// Parse a StreamOpen payload into its id and request.
pub fn parse_open(payload: &Bytes) -> Result<(u32, OpenRequest)> {
    let (id, rest) = split_stream_id(payload)?;
    let mut input = &rest[..];
    let kind_code = take_u8(&mut input)?;
    let kind = OperationKind::from_code(kind_code).ok_or(WireError::UnknownCode(kind_code))?;
    Ok((id, OpenRequest::parse(kind, input)?))
}

/// Parse a StreamEnd payload: id, status, kind-specific trailer.
pub fn parse_end(payload: &Bytes) -> Result<(u32, EndStatus, Bytes)> {
    let (id, rest) = split_stream_id(payload)?;
    if rest.is_empty() {
        return Err(WireError::Truncated);
    }
    let status = EndStatus::from_code(rest[0]).ok_or(WireError::UnknownCode(rest[0]))?;
    Ok((id, status, rest.slice(1..)))
}

/// Parse a StreamError payload: id, code, NUL-terminated message.
pub fn parse_error(payload: &Bytes) -> Result<(u32, ErrorCode, String)> {
    let (id, rest) = split_stream_id(payload)?;
    let mut input = &rest[..];
    let code_byte = take_u8(&mut input)?;
    let code = ErrorCode::from_code(code_byte).ok_or(WireError::UnknownCode(code_byte))?;
    let message = take_cstr(&mut input)?;
    Ok((id, code, String::from_utf8_lossy(message).into_owned()))
}

/// Parse a StreamCancel payload.
pub fn parse_cancel(payload: &Bytes) -> Result<u32> {
    let (id, rest) = split_stream_id(payload)?;
    if !rest.is_empty() {
        return Err(WireError::TrailingBytes);
    }
    Ok(id)
}

/// Parse a WindowUpdate payload.
pub fn parse_window_update(payload: &Bytes) -> Result<u32> {
    let mut input = &payload[..];
    let increment = take_u32(&mut input)?;
    if !input.is_empty() {
        return Err(WireError::TrailingBytes);
    }
    Ok(increment)
}

/// What a directory entry or stat target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryKind {
    pub fn code(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Dir => 1,
            EntryKind::Symlink => 2,
            EntryKind::Other => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<EntryKind> {
        match code {
            0 => Some(EntryKind::File),
            1 => Some(EntryKind::Dir),
            2 => Some(EntryKind::Symlink),
            3 => Some(EntryKind::Other),
            _ => None,
        }
    }
}

/// The single Data payload of a Stat/Lstat stream. Exactly 22 bytes on
/// the wire: exists u8, kind u8, mode u32, size u64, mtime u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatReply {
    pub exists: bool,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
}

impl StatReply {
    pub const SIZE: usize = 22;

    /// The fixed reply for a path that is not there.
    pub fn absent() -> StatReply {
        StatReply {
            exists: false,
            kind: EntryKind::Other,
            mode: 0,
            size: 0,
            mtime: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.exists as u8);
        buf.put_u8(if self.exists { self.kind.code() } else { 0 });
        buf.put_u32(self.mode);
        buf.put_u64(self.size);
        buf.put_u64(self.mtime);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<StatReply> {
        let mut input = payload;
        let exists = take_u8(&mut input)? != 0;
        let kind_code = take_u8(&mut input)?;
        let kind = EntryKind::from_code(kind_code).ok_or(WireError::UnknownCode(kind_code))?;
        let mode = take_u32(&mut input)?;
        let size = take_u64(&mut input)?;
        let mtime = take_u64(&mut input)?;
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(StatReply {
            exists,
            kind,
            mode,
            size,
            mtime,
        })
    }
}

/// One Data payload of a ListDir stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryReply {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: u64,
    pub name: Vec<u8>,
}

impl DirEntryReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(18 + self.name.len());
        buf.put_u8(self.kind.code());
        buf.put_u64(self.size);
        buf.put_u64(self.mtime);
        put_cstr(&mut buf, &self.name);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<DirEntryReply> {
        let mut input = payload;
        let kind_code = take_u8(&mut input)?;
        let kind = EntryKind::from_code(kind_code).ok_or(WireError::UnknownCode(kind_code))?;
        let size = take_u64(&mut input)?;
        let mtime = take_u64(&mut input)?;
        let name = take_cstr(&mut input)?.to_vec();
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(DirEntryReply {
            kind,
            size,
            mtime,
            name,
        })
    }
}

/// One Data payload of a Search stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub line: u32,
    pub path: Vec<u8>,
    pub text: Vec<u8>,
}

impl SearchHit {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6 + self.path.len() + self.text.len());
        buf.put_u32(self.line);
        put_cstr(&mut buf, &self.path);
        put_cstr(&mut buf, &self.text);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<SearchHit> {
        let mut input = payload;
        let line = take_u32(&mut input)?;
        let path = take_cstr(&mut input)?.to_vec();
        let text = take_cstr(&mut input)?.to_vec();
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(SearchHit { line, path, text })
    }
}

/// Which pipe an Execute output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecChannel {
    Stdout,
    Stderr,
}

impl ExecChannel {
    pub fn code(self) -> u8 {
        match self {
            ExecChannel::Stdout => 0,
            ExecChannel::Stderr => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<ExecChannel> {
        match code {
            0 => Some(ExecChannel::Stdout),
            1 => Some(ExecChannel::Stderr),
            _ => None,
        }
    }
}

/// Build the Data body of an Execute output chunk.
pub fn encode_exec_chunk(channel: ExecChannel, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(channel.code());
    buf.put_slice(data);
    buf.freeze()
}

/// Split an Execute Data body into its channel and bytes.
pub fn decode_exec_chunk(payload: &Bytes) -> Result<(ExecChannel, Bytes)> {
    if payload.is_empty() {
        return Err(WireError::Truncated);
    }
    let channel = ExecChannel::from_code(payload[0]).ok_or(WireError::UnknownCode(payload[0]))?;
    Ok((channel, payload.slice(1..)))
}

/// Build the trailer of an Execute StreamEnd: the exit code or signal
/// number for the statuses that have one, nothing otherwise.
pub fn encode_exit_detail(status: EndStatus, detail: u32) -> Bytes {
    match status {
        EndStatus::NormalExit | EndStatus::KilledBySignal => {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(detail);
            buf.freeze()
        }
        _ => Bytes::new(),
    }
}

/// Read an Execute exit detail back out of an End trailer.
pub fn decode_exit_detail(trailer: &[u8]) -> Option<u32> {
    if trailer.len() == 4 {
        Some(u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]))
    } else {
        None
    }
}
