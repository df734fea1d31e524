//! Content search handler.
//!
//! A bounded substring hunt over a subtree: walk with the same explicit
//! stack discipline as the glob find, skip directories and files that
//! cannot usefully match, then scan survivors line by line with a
//! Boyer-Moore-Horspool search. The skip table is built once per Open
//! and the file buffer is reused across files, so the hot loop does not
//! allocate.

use std::collections::HashSet;
use std::path::PathBuf;

use bytes::Bytes;
use once_cell::sync::Lazy;
use tokio::fs;
use tokio::io::AsyncReadExt;

use kakehashi_wire::{EndStatus, SearchHit};

use crate::connection::stream::StreamIo;

use super::glob::glob_match;
use super::{Emit, emit, finish_cancelled, map_io_error, path_leaf_bytes, path_to_bytes};

/// Deepest directory level the search descends to, base = 0.
pub(crate) const SEARCH_MAX_DEPTH: usize = 32;

/// Files larger than this are skipped outright.
pub(crate) const SEARCH_MAX_FILE_SIZE: u64 = 512 * 1024;

/// Result cap: the stream ends cleanly once this many hits are out.
pub(crate) const SEARCH_MAX_MATCHES: usize = 200;

/// Work cap: the stream ends cleanly once this many files were scanned.
pub(crate) const SEARCH_MAX_FILES: usize = 500;

/// A NUL in the first this-many bytes marks a file as binary.
const BINARY_SNIFF: usize = 512;

/// Directories that are never worth descending into, beyond the
/// `.`-prefixed rule.
static SKIP_DIRS: Lazy<HashSet<&'static [u8]>> = Lazy::new(|| {
    let names: [&'static [u8]; 4] = [b"node_modules", b"target", b"build", b"__pycache__"];
    names.into_iter().collect()
});

/// Extensions (lowercase, no dot) whose contents are binary-likely.
static SKIP_EXTENSIONS: Lazy<HashSet<&'static [u8]>> = Lazy::new(|| {
    let exts: [&'static [u8]; 24] = [
        b"o", b"obj", b"a", b"so", b"dylib", b"dll", b"exe", b"bin", b"png", b"jpg", b"jpeg",
        b"gif", b"bmp", b"ico", b"zip", b"tar", b"gz", b"bz2", b"xz", b"7z", b"pdf", b"class",
        b"pyc", b"wasm",
    ];
    exts.into_iter().collect()
});

fn skip_dir(name: &[u8]) -> bool {
    name.starts_with(b".") || SKIP_DIRS.contains(name)
}

fn skip_extension(name: &[u8]) -> bool {
    match name.rsplit(|&b| b == b'.').next() {
        Some(ext) if ext.len() < name.len() => {
            let lowered: Vec<u8> = ext.iter().map(|b| b.to_ascii_lowercase()).collect();
            SKIP_EXTENSIONS.contains(&lowered[..])
        }
        _ => false,
    }
}

/// Boyer-Moore-Horspool substring search with a 256-entry skip table.
pub struct Finder {
    needle: Vec<u8>,
    skip: [usize; 256],
}

impl Finder {
    pub fn new(needle: &[u8]) -> Finder {
        let mut skip = [needle.len(); 256];
        if !needle.is_empty() {
            for (i, &b) in needle[..needle.len() - 1].iter().enumerate() {
                skip[b as usize] = needle.len() - 1 - i;
            }
        }
        Finder {
            needle: needle.to_vec(),
            skip,
        }
    }

    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        let m = self.needle.len();
        if m == 0 {
            return Some(0);
        }
        if haystack.len() < m {
            return None;
        }
        let mut pos = 0usize;
        while pos + m <= haystack.len() {
            if haystack[pos..pos + m] == self.needle[..] {
                return Some(pos);
            }
            let last = haystack[pos + m - 1];
            pos += self.skip[last as usize];
        }
        None
    }
}

pub(crate) async fn search(
    base: PathBuf,
    needle: Vec<u8>,
    file_pattern: Option<Vec<u8>>,
    mut io: StreamIo,
) {
    let finder = Finder::new(&needle);
    let mut stack: Vec<(PathBuf, usize)> = vec![(base, 0)];
    let mut file_buf: Vec<u8> = Vec::new();
    let mut files_scanned = 0usize;
    let mut matches = 0usize;

    while let Some((dir, depth)) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if depth == 0 => {
                let _ = io.handle.fail(map_io_error(&err), &err.to_string());
                return;
            }
            Err(_) => continue,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let name = path_leaf_bytes(&entry.file_name());

            if file_type.is_dir() {
                if !file_type.is_symlink() && !skip_dir(&name) && depth < SEARCH_MAX_DEPTH {
                    stack.push((entry.path(), depth + 1));
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if let Some(pattern) = &file_pattern {
                if !glob_match(pattern, &name) {
                    continue;
                }
            }
            if skip_extension(&name) {
                continue;
            }
            let Ok(md) = entry.metadata().await else {
                continue;
            };
            if md.len() == 0 || md.len() > SEARCH_MAX_FILE_SIZE {
                continue;
            }

            if files_scanned >= SEARCH_MAX_FILES {
                let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
                return;
            }
            files_scanned += 1;

            file_buf.clear();
            let Ok(mut file) = fs::File::open(entry.path()).await else {
                continue;
            };
            if file.read_to_end(&mut file_buf).await.is_err() {
                continue;
            }
            let sniff = file_buf.len().min(BINARY_SNIFF);
            if file_buf[..sniff].contains(&0) {
                continue;
            }

            let path = path_to_bytes(&entry.path());
            for (index, line) in file_buf.split(|&b| b == b'\n').enumerate() {
                let line = if line.ends_with(b"\r") {
                    &line[..line.len() - 1]
                } else {
                    line
                };
                if finder.find(line).is_none() {
                    continue;
                }
                let hit = SearchHit {
                    line: index as u32 + 1,
                    path: path.clone(),
                    text: line.to_vec(),
                };
                match emit(&mut io, hit.encode()).await {
                    Emit::Sent => {}
                    Emit::Cancelled => {
                        finish_cancelled(&io);
                        return;
                    }
                    Emit::Gone => return,
                }
                matches += 1;
                if matches >= SEARCH_MAX_MATCHES {
                    let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
                    return;
                }
            }
        }
    }

    let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
}
