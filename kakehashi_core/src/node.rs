//! The legacy-side endpoint.
//!
//! Dials the relay, speaks Hello first, then lives two lives at once:
//! its terminal pumps mirror the Host Agent session onto the local
//! stdin/stdout, while the operation dispatcher serves the relay's file,
//! search and process streams against the local machine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use kakehashi_wire::{GoodbyeReason, SessionFlags};

use crate::connection::error::Result;
use crate::connection::session::{Farewell, Session, SessionConfig, SessionControl};
use crate::debug_log;
use crate::ops::{NodeDispatcher, path_to_bytes};
use crate::terminal::{TerminalEvent, TerminalTx};
use crate::trace::TraceLog;

/// Everything the CLI hands over.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub flags: SessionFlags,
    pub recv_window: u32,
    pub log: bool,
}

/// Dial the relay and run the session to completion. Returns the
/// farewell on any orderly Goodbye; connection, handshake and protocol
/// failures surface as errors for the CLI to turn into exit codes.
pub async fn run_node(config: NodeConfig) -> Result<Farewell> {
    let addr = format!("{}:{}", config.host, config.port);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    debug_log!("connected to {}", addr);

    let cwd = std::env::current_dir()?;
    let mut session_config = SessionConfig::node(path_to_bytes(&cwd))
        .flags(config.flags)
        .recv_window(config.recv_window);
    if config.log {
        let trace = TraceLog::open()?;
        eprintln!("kakehashi: protocol trace at {}", trace.path().display());
        session_config = session_config.trace(Arc::new(trace));
    }

    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (session, control) = Session::new(
        session_config,
        Arc::new(NodeDispatcher::new(cwd)),
        sink_tx,
    );

    let stdin_pump = tokio::spawn(pump_stdin(control.terminal(), control.clone()));
    let output_pump = tokio::spawn(pump_output(sink_rx));
    #[cfg(unix)]
    let winch_pump = tokio::spawn(pump_winch(control.terminal()));

    let result = session.run(stream).await;

    stdin_pump.abort();
    output_pump.abort();
    #[cfg(unix)]
    winch_pump.abort();

    result
}

/// Local keystrokes onto the wire. Stdin closing ends the session
/// politely: the user is done.
async fn pump_stdin(terminal: TerminalTx, control: SessionControl) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                control.shutdown(GoodbyeReason::Normal, "stdin closed");
                return;
            }
            Ok(n) => {
                if terminal
                    .send_input(Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(_) => {
                control.shutdown(GoodbyeReason::Normal, "stdin error");
                return;
            }
        }
    }
}

/// Host Agent screen bytes onto the local terminal, flushed per chunk
/// for interactive latency.
async fn pump_output(mut events: mpsc::UnboundedReceiver<TerminalEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        if let TerminalEvent::Output(data) = event {
            if stdout.write_all(&data).await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    }
}

/// Watch for SIGWINCH and forward the new geometry; also announces the
/// initial size so the relay's PTY starts out right.
#[cfg(unix)]
async fn pump_winch(terminal: TerminalTx) {
    use tokio::signal::unix::{SignalKind, signal};

    if let Some((cols, rows)) = winsize() {
        let _ = terminal.resize(cols, rows);
    }
    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        return;
    };
    while winch.recv().await.is_some() {
        if let Some((cols, rows)) = winsize() {
            if terminal.resize(cols, rows).is_err() {
                return;
            }
        }
    }
}

#[cfg(unix)]
fn winsize() -> Option<(u16, u16)> {
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_col > 0 {
            Some((ws.ws_col, ws.ws_row))
        } else {
            None
        }
    }
}
