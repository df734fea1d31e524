//! Operation handlers: the legacy-side realization of each stream kind.
//!
//! The session loop parses an Open and hands the typed request to the
//! installed `OperationDispatcher`, which spawns one task per stream.
//! Handlers talk back exclusively through their `StreamIo`: data emission
//! waits on window credit, termination is a single End or Error, and a
//! peer cancel arrives as an event on the same channel.

pub mod dir;
pub mod exec;
pub mod fs;
pub mod glob;
pub mod search;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::task::JoinHandle;

use kakehashi_wire::{EndStatus, ErrorCode, OpenRequest};

use crate::connection::stream::{StreamEvent, StreamIo};

/// Serves inbound stream opens. Implementations decide which kinds they
/// serve; returning an error code rejects the stream without touching
/// the connection.
pub trait OperationDispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        request: OpenRequest,
        io: StreamIo,
    ) -> std::result::Result<JoinHandle<()>, ErrorCode>;
}

/// Dispatcher for an endpoint that serves nothing. The relay installs
/// this; no relay-side stream kinds are defined.
pub struct RejectDispatcher;

impl OperationDispatcher for RejectDispatcher {
    fn dispatch(
        &self,
        _request: OpenRequest,
        _io: StreamIo,
    ) -> std::result::Result<JoinHandle<()>, ErrorCode> {
        Err(ErrorCode::Invalid)
    }
}

/// The legacy endpoint's dispatcher: file, directory, glob, search and
/// process operations, with relative paths resolved against the working
/// directory announced in Hello.
pub struct NodeDispatcher {
    cwd: PathBuf,
}

impl NodeDispatcher {
    pub fn new(cwd: PathBuf) -> NodeDispatcher {
        NodeDispatcher { cwd }
    }

    fn resolve(&self, raw: &[u8]) -> PathBuf {
        let path = bytes_to_path(raw);
        if path.is_absolute() {
            path
        } else {
            self.cwd.join(path)
        }
    }
}

impl OperationDispatcher for NodeDispatcher {
    fn dispatch(
        &self,
        request: OpenRequest,
        io: StreamIo,
    ) -> std::result::Result<JoinHandle<()>, ErrorCode> {
        let task = match request {
            OpenRequest::FileRead { path } => tokio::spawn(fs::file_read(self.resolve(&path), io)),
            OpenRequest::FileWrite { path, mode } => {
                tokio::spawn(fs::file_write(self.resolve(&path), mode, io))
            }
            OpenRequest::Stat { path } => tokio::spawn(fs::stat(self.resolve(&path), true, io)),
            OpenRequest::Lstat { path } => tokio::spawn(fs::stat(self.resolve(&path), false, io)),
            OpenRequest::Exists { path } => tokio::spawn(fs::exists(self.resolve(&path), io)),
            OpenRequest::MakeDir { path } => tokio::spawn(fs::make_dir(self.resolve(&path), io)),
            OpenRequest::Remove { path } => tokio::spawn(fs::remove(self.resolve(&path), io)),
            OpenRequest::Move { src, dst } => {
                tokio::spawn(fs::rename(self.resolve(&src), self.resolve(&dst), io))
            }
            OpenRequest::ResolvePath { path } => {
                tokio::spawn(fs::resolve_path(self.resolve(&path), io))
            }
            OpenRequest::ListDir { path } => tokio::spawn(dir::list_dir(self.resolve(&path), io)),
            OpenRequest::GlobFind { base, pattern } => {
                tokio::spawn(glob::glob_find(self.resolve(&base), pattern, io))
            }
            OpenRequest::Search { base, needle, file_pattern } => {
                tokio::spawn(search::search(self.resolve(&base), needle, file_pattern, io))
            }
            OpenRequest::Execute { command } => tokio::spawn(exec::execute(command, io)),
        };
        Ok(task)
    }
}

#[cfg(unix)]
pub(crate) fn bytes_to_path(raw: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(raw))
}

#[cfg(not(unix))]
pub(crate) fn bytes_to_path(raw: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(raw).into_owned())
}

#[cfg(unix)]
pub(crate) fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub(crate) fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
pub(crate) fn path_leaf_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
pub(crate) fn path_leaf_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

/// Wire code for a filesystem error.
pub(crate) fn map_io_error(err: &std::io::Error) -> ErrorCode {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => ErrorCode::NotFound,
        ErrorKind::PermissionDenied => ErrorCode::Permission,
        ErrorKind::AlreadyExists => ErrorCode::Exists,
        ErrorKind::NotADirectory => ErrorCode::NotDir,
        ErrorKind::IsADirectory => ErrorCode::IsDir,
        _ => ErrorCode::IoError,
    }
}

/// Outcome of trying to emit one Data chunk.
pub(crate) enum Emit {
    Sent,
    /// Peer asked us to stop; the caller cleans up, then acknowledges
    /// with End(Cancelled).
    Cancelled,
    /// Stream or session is gone; nothing further may be sent.
    Gone,
}

/// Send a chunk, staying responsive to cancellation while parked on
/// window credit.
pub(crate) async fn emit(io: &mut StreamIo, body: Bytes) -> Emit {
    let send = io.handle.send_data(body);
    tokio::pin!(send);
    loop {
        tokio::select! {
            biased;
            event = io.events.recv() => match event {
                Some(StreamEvent::Cancel) => return Emit::Cancelled,
                Some(StreamEvent::Error { .. }) | None => return Emit::Gone,
                // Nothing else is expected on a reply-only stream; keep
                // the send in flight.
                Some(_) => continue,
            },
            sent = &mut send => {
                return match sent {
                    Ok(()) => Emit::Sent,
                    Err(_) => Emit::Gone,
                };
            }
        }
    }
}

/// Shorthand for the acknowledge-a-cancel epilogue.
pub(crate) fn finish_cancelled(io: &StreamIo) {
    let _ = io.handle.finish(EndStatus::Cancelled, Bytes::new());
}
