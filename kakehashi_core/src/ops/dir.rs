//! Directory enumeration handler.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs;

use kakehashi_wire::{DirEntryReply, EndStatus, EntryKind, ErrorCode};

use crate::connection::stream::StreamIo;

use super::{Emit, emit, finish_cancelled, map_io_error, path_leaf_bytes};

/// One Data packet per entry, `.` and `..` never appear (read_dir does
/// not yield them). A failed stat on an individual entry degrades that
/// entry to kind=other with zeroed metadata instead of failing the
/// stream.
pub(crate) async fn list_dir(path: PathBuf, mut io: StreamIo) {
    let mut entries = match fs::read_dir(&path).await {
        Ok(entries) => entries,
        Err(err) => {
            let _ = io.handle.fail(map_io_error(&err), &err.to_string());
            return;
        }
    };

    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = path_leaf_bytes(&entry.file_name());
                // DirEntry::metadata does not traverse symlinks, so a
                // link shows up as a link.
                let reply = match entry.metadata().await {
                    Ok(md) => {
                        let stat = super::fs::metadata_reply(&md);
                        DirEntryReply {
                            kind: stat.kind,
                            size: stat.size,
                            mtime: stat.mtime,
                            name,
                        }
                    }
                    Err(_) => DirEntryReply {
                        kind: EntryKind::Other,
                        size: 0,
                        mtime: 0,
                        name,
                    },
                };
                match emit(&mut io, reply.encode()).await {
                    Emit::Sent => {}
                    Emit::Cancelled => {
                        finish_cancelled(&io);
                        return;
                    }
                    Emit::Gone => return,
                }
            }
            Ok(None) => {
                let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
                return;
            }
            Err(err) => {
                let _ = io.handle.fail(ErrorCode::IoError, &err.to_string());
                return;
            }
        }
    }
}
