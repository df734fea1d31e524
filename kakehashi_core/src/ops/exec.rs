//! Process execution handler.
//!
//! The command string goes to the platform shell. Output is forwarded
//! eagerly: whatever a pipe read returns goes straight onto the wire
//! with its channel tag, never held back to fill a chunk. The other end
//! of this is a human watching a command run. Cancellation sends
//! SIGTERM, waits briefly, then escalates.

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use kakehashi_wire::meta::{ExecChannel, encode_exec_chunk, encode_exit_detail};
use kakehashi_wire::{EndStatus, ErrorCode};

use crate::connection::stream::{StreamEvent, StreamIo};

use super::{Emit, emit};

/// Grace period between SIGTERM and the hard kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Pipe read size. Kept small; output is forwarded as it appears.
const PIPE_CHUNK: usize = 8 * 1024;

#[cfg(unix)]
fn shell_command(command: &[u8]) -> Command {
    use std::os::unix::ffi::OsStrExt;
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(std::ffi::OsStr::from_bytes(command));
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &[u8]) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(String::from_utf8_lossy(command).into_owned());
    cmd
}

pub(crate) async fn execute(command: Vec<u8>, mut io: StreamIo) {
    let mut cmd = shell_command(&command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // The child must not outlive the stream under any teardown path.
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let _ = io.handle.fail(ErrorCode::IoError, &err.to_string());
            return;
        }
    };
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let mut out_buf = vec![0u8; PIPE_CHUNK];
    let mut err_buf = vec![0u8; PIPE_CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        let forward: Option<(ExecChannel, usize)> = tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => {
                    out_open = false;
                    None
                }
                Ok(n) => Some((ExecChannel::Stdout, n)),
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => {
                    err_open = false;
                    None
                }
                Ok(n) => Some((ExecChannel::Stderr, n)),
            },
            event = io.events.recv() => match event {
                Some(StreamEvent::Cancel) => {
                    terminate(&mut child).await;
                    let _ = io.handle.finish(EndStatus::Cancelled, Bytes::new());
                    return;
                }
                Some(StreamEvent::Error { .. }) | None => {
                    terminate(&mut child).await;
                    return;
                }
                Some(_) => None,
            },
        };

        if let Some((channel, n)) = forward {
            let data = match channel {
                ExecChannel::Stdout => &out_buf[..n],
                ExecChannel::Stderr => &err_buf[..n],
            };
            match emit(&mut io, encode_exec_chunk(channel, data)).await {
                Emit::Sent => {}
                Emit::Cancelled => {
                    terminate(&mut child).await;
                    let _ = io.handle.finish(EndStatus::Cancelled, Bytes::new());
                    return;
                }
                Emit::Gone => {
                    terminate(&mut child).await;
                    return;
                }
            }
        }
    }

    let (status, detail) = match child.wait().await {
        Ok(status) => classify(status),
        Err(_) => (EndStatus::Unknown, 0),
    };
    let _ = io.handle.finish(status, encode_exit_detail(status, detail));
}

fn classify(status: std::process::ExitStatus) -> (EndStatus, u32) {
    if let Some(code) = status.code() {
        return (EndStatus::NormalExit, code as u32);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (EndStatus::KilledBySignal, signal as u32);
        }
    }
    (EndStatus::Unknown, 0)
}

/// Best-effort stop: SIGTERM, a grace period, then the hard kill. The
/// child is reaped either way.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
