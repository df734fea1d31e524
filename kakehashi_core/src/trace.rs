//! Protocol trace log behind the `--log` flag.
//!
//! One line per packet, either direction, appended to a fixed-name file
//! in the working directory (falling back to the system temp directory
//! when the cwd is not writable). The format is for humans staring at a
//! broken session, not for machines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;

use kakehashi_wire::Packet;

/// Fixed trace file name.
pub const TRACE_FILE_NAME: &str = "kakehashi-trace.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug)]
pub struct TraceLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl TraceLog {
    /// Open the trace file in `cwd`, or in the temp directory when that
    /// fails. Returns the log and where it actually landed.
    pub fn open() -> std::io::Result<TraceLog> {
        let primary = PathBuf::from(TRACE_FILE_NAME);
        let open = |path: &PathBuf| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
        };
        match open(&primary) {
            Ok(file) => Ok(TraceLog {
                file: Mutex::new(file),
                path: primary,
            }),
            Err(_) => {
                let fallback = std::env::temp_dir().join(TRACE_FILE_NAME);
                let file = open(&fallback)?;
                Ok(TraceLog {
                    file: Mutex::new(file),
                    path: fallback,
                })
            }
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one line for `packet`. Trace failures are swallowed; the
    /// log must never take the session down with it.
    pub fn record(&self, direction: Direction, packet: &Packet) {
        let arrow = match direction {
            Direction::In => "<-",
            Direction::Out => "->",
        };
        let mut line = format!("{} {} len={}", arrow, packet.kind, packet.payload.len());
        if packet.kind.addresses_stream() && packet.payload.len() >= 4 {
            let id = u32::from_be_bytes([
                packet.payload[0],
                packet.payload[1],
                packet.payload[2],
                packet.payload[3],
            ]);
            line.push_str(&format!(" stream={}", id));
        }
        line.push('\n');
        let mut file = self.file.lock();
        let _ = file.write_all(line.as_bytes());
    }
}
