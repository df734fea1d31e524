//! Glob matching and the subtree find handler.
//!
//! The matcher covers the shell subset: `*` (anything but `/`), `?`
//! (exactly one byte), `[abc]`/`[a-z]`/`[!abc]` classes, everything else
//! literal. Iterative backtracking with a single saved `*` anchor: no
//! allocation, no recursion, O(n·m) worst case.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs;

use kakehashi_wire::EndStatus;

use crate::connection::stream::StreamIo;

use super::{Emit, emit, finish_cancelled, map_io_error, path_to_bytes};

/// Deepest directory level the find walk descends to, root = 0.
pub(crate) const GLOB_MAX_DEPTH: usize = 64;

/// Match `name` against `pattern`, byte-wise.
pub fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let mut p = 0usize;
    let mut n = 0usize;
    // The most recent `*`: position after it, and how much of the name
    // it has swallowed so far.
    let mut star_p = usize::MAX;
    let mut star_n = 0usize;

    while n < name.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star_p = p + 1;
                    star_n = n;
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    n += 1;
                    continue;
                }
                b'[' => {
                    if let Some((hit, next)) = match_class(pattern, p, name[n]) {
                        if hit {
                            p = next;
                            n += 1;
                            continue;
                        }
                        // fall through to backtrack
                    } else if pattern[p] == name[n] {
                        // Unterminated class: `[` is a literal.
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == name[n] {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
            }
        }
        // Mismatch. Grow the last star by one byte, unless there is no
        // star or the byte is a separator.
        if star_p != usize::MAX && name[star_n] != b'/' {
            star_n += 1;
            n = star_n;
            p = star_p;
            continue;
        }
        return false;
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Match one byte against the class starting at `pattern[start] == '['`.
/// Returns the verdict and the index just past `]`, or None when the
/// class never closes.
fn match_class(pattern: &[u8], start: usize, byte: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let mut negate = false;
    if i < pattern.len() && pattern[i] == b'!' {
        negate = true;
        i += 1;
    }
    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            if pattern[i] <= byte && byte <= pattern[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pattern[i] == byte {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

/// Walk the subtree under `base` with an explicit stack, matching each
/// entry's leaf name and emitting the absolute paths that hit.
/// Symlinked directories are never entered; depth is capped so a
/// link cycle reachable some other way still cannot wedge the walk.
pub(crate) async fn glob_find(base: PathBuf, pattern: Vec<u8>, mut io: StreamIo) {
    let mut stack: Vec<(PathBuf, usize)> = vec![(base, 0)];

    while let Some((dir, depth)) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if depth == 0 => {
                // The base itself must be readable; everything deeper
                // is best-effort.
                let _ = io.handle.fail(map_io_error(&err), &err.to_string());
                return;
            }
            Err(_) => continue,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() && !file_type.is_symlink() && depth < GLOB_MAX_DEPTH {
                stack.push((entry.path(), depth + 1));
            }
            let name = entry.file_name();
            if glob_match(&pattern, &super::path_leaf_bytes(&name)) {
                let mut body = path_to_bytes(&entry.path());
                body.push(0);
                match emit(&mut io, Bytes::from(body)).await {
                    Emit::Sent => {}
                    Emit::Cancelled => {
                        finish_cancelled(&io);
                        return;
                    }
                    Emit::Gone => return,
                }
            }
        }
    }

    let _ = io.handle.finish(EndStatus::Ok, Bytes::new());
}
