//! File operation handlers.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kakehashi_wire::{EndStatus, EntryKind, ErrorCode, StatReply};

use crate::connection::stream::{DATA_CHUNK, StreamEvent, StreamIo};

use super::{Emit, emit, finish_cancelled, map_io_error, path_to_bytes};

/// Stream a file's bytes in chunks of at most 64 KiB, each one gated on
/// window credit.
pub(crate) async fn file_read(path: PathBuf, mut io: StreamIo) {
    let mut file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
            return;
        }
    };

    let mut scratch = vec![0u8; DATA_CHUNK];
    loop {
        // Clamp to the peer's window so one chunk always fits through.
        let chunk = io.handle.max_chunk().min(scratch.len());
        match file.read(&mut scratch[..chunk]).await {
            Ok(0) => {
                let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
                return;
            }
            Ok(n) => match emit(&mut io, Bytes::copy_from_slice(&scratch[..n])).await {
                Emit::Sent => {}
                Emit::Cancelled => {
                    finish_cancelled(&io);
                    return;
                }
                Emit::Gone => return,
            },
            Err(err) => {
                let _ = io.handle.fail(ErrorCode::IoError, &err.to_string());
                return;
            }
        }
    }
}

/// Create/truncate, then append inbound Data until the peer's End.
/// Append-to-existing is deliberately unsupported; callers wanting it
/// read, modify and write back.
pub(crate) async fn file_write(path: PathBuf, mode: u32, mut io: StreamIo) {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        let mode = if mode == 0 { 0o644 } else { mode };
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = match options.open(&path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
            return;
        }
    };

    while let Some(event) = io.events.recv().await {
        match event {
            StreamEvent::Data(chunk) => {
                if let Err(err) = file.write_all(&chunk).await {
                    let _ = io.handle.fail(ErrorCode::IoError, &err.to_string());
                    return;
                }
            }
            StreamEvent::End { .. } => {
                if let Err(err) = file.flush().await {
                    let _ = io.handle.fail(ErrorCode::IoError, &err.to_string());
                    return;
                }
                let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
                return;
            }
            StreamEvent::Cancel => {
                // Whatever made it to disk stays; the peer knows the
                // write did not complete.
                let _ = file.flush().await;
                finish_cancelled(&io);
                return;
            }
            StreamEvent::Error { .. } => return,
        }
    }
}

/// One 22-byte reply; a missing path is a normal reply with exists=0,
/// not an error.
pub(crate) async fn stat(path: PathBuf, follow: bool, mut io: StreamIo) {
    let looked_up = if follow {
        fs::metadata(&path).await
    } else {
        fs::symlink_metadata(&path).await
    };
    let reply = match looked_up {
        Ok(md) => metadata_reply(&md),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => StatReply::absent(),
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
            return;
        }
    };
    if matches!(emit(&mut io, reply.encode()).await, Emit::Sent) {
        let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
    }
}

pub(crate) async fn exists(path: PathBuf, mut io: StreamIo) {
    let present = fs::symlink_metadata(&path).await.is_ok();
    if matches!(emit(&mut io, Bytes::copy_from_slice(&[present as u8])).await, Emit::Sent) {
        let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
    }
}

/// Idempotent: an existing directory at the path is success.
pub(crate) async fn make_dir(path: PathBuf, io: StreamIo) {
    match fs::create_dir(&path).await {
        Ok(()) => {
            let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let is_dir = fs::metadata(&path)
                .await
                .map(|md| md.is_dir())
                .unwrap_or(false);
            if is_dir {
                let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
            } else {
                let _ = io.handle.fail(ErrorCode::Exists, "path exists and is not a directory");
            }
        }
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
        }
    }
}

/// Unlink only; directories are refused with IsDir.
pub(crate) async fn remove(path: PathBuf, io: StreamIo) {
    match fs::remove_file(&path).await {
        Ok(()) => {
            let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
        }
        Err(err) => {
            let code = if fs::metadata(&path).await.map(|md| md.is_dir()).unwrap_or(false) {
                ErrorCode::IsDir
            } else {
                map_io_error(&err)
            };
            let _ = io.handle.fail(code, &err.to_string());
        }
    }
}

/// Rename within a filesystem. A cross-device rename surfaces the
/// underlying error rather than degrading to copy-and-delete.
pub(crate) async fn rename(src: PathBuf, dst: PathBuf, io: StreamIo) {
    match fs::rename(&src, &dst).await {
        Ok(()) => {
            let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
        }
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
        }
    }
}

/// Canonicalize: dereference symlinks, collapse dot components.
pub(crate) async fn resolve_path(path: PathBuf, mut io: StreamIo) {
    match fs::canonicalize(&path).await {
        Ok(resolved) => {
            let mut body = path_to_bytes(&resolved);
            body.push(0);
            if matches!(emit(&mut io, Bytes::from(body)).await, Emit::Sent) {
                let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
            }
        }
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
        }
    }
}

/// Shared metadata-to-wire conversion for stat and directory listings.
pub(crate) fn metadata_reply(md: &std::fs::Metadata) -> StatReply {
    let file_type = md.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    StatReply {
        exists: true,
        kind,
        mode: mode_bits(md),
        size: md.len(),
        mtime: md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    }
}

#[cfg(unix)]
fn mode_bits(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
fn mode_bits(_md: &std::fs::Metadata) -> u32 {
    0
}
