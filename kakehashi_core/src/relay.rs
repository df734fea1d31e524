//! The Host-Agent-side relay endpoint.
//!
//! Accepts the legacy connection, answers HelloAck, and bridges two
//! worlds into the one wire: the Host Agent's terminal surface (behind
//! the `HostTerminal` trait; the PTY spawn glue lives elsewhere) and
//! the tool-call adapter (behind `RelayHandle`, where every call is
//! exactly one stream, drained to completion).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use kakehashi_wire::meta::{ExecChannel, decode_exec_chunk, decode_exit_detail};
use kakehashi_wire::{
    DirEntryReply, EndStatus, ErrorCode, GoodbyeReason, OpenRequest, Packet, SearchHit, StatReply,
};

use crate::connection::error::Result;
use crate::connection::session::{Farewell, Session, SessionConfig, SessionControl};
use crate::connection::stream::{OpError, OpResult, OpenedStream, StreamEvent};
use crate::ops::RejectDispatcher;
use crate::terminal::TerminalEvent;
use crate::trace::TraceLog;
use crate::{debug_log, debug_warn};

/// The Host Agent's interactive surface. Output chunks flow toward the
/// legacy terminal; input and resize flow back. An empty output chunk
/// means the surface closed.
#[async_trait]
pub trait HostTerminal: Send + 'static {
    async fn read_output(&mut self) -> std::io::Result<Bytes>;
    async fn write_input(&mut self, data: &[u8]) -> std::io::Result<()>;
    async fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()>;
}

/// The simple-mode output transform: bytes in, bytes out, state kept
/// across calls. The real SGR/UTF-8 downconverter is an external
/// collaborator; the identity filter stands in when the legacy side did
/// not ask for filtering.
pub trait TerminalFilter: Send + 'static {
    fn filter(&mut self, input: &[u8], out: &mut Vec<u8>);
}

/// Pass-through filter.
pub struct IdentityFilter;

impl TerminalFilter for IdentityFilter {
    fn filter(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(input);
    }
}

/// A `HostTerminal` over this process's own stdio: the arrangement when
/// the Host Agent spawns the relay as a subprocess and speaks to it over
/// pipes. Resize has nowhere to go and is dropped.
pub struct StdioTerminal {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
    buf: Vec<u8>,
}

impl StdioTerminal {
    pub fn new() -> StdioTerminal {
        StdioTerminal {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
            buf: vec![0u8; 8 * 1024],
        }
    }
}

impl Default for StdioTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostTerminal for StdioTerminal {
    async fn read_output(&mut self) -> std::io::Result<Bytes> {
        let n = self.stdin.read(&mut self.buf).await?;
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    async fn write_input(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stdout.write_all(data).await?;
        self.stdout.flush().await
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> std::io::Result<()> {
        Ok(())
    }
}

/// Start a relay session over an accepted transport. Returns the
/// tool-call handle immediately and drives the session in a spawned
/// task; the handle stays valid until the task finishes.
pub fn start<S>(
    io: S,
    config: SessionConfig,
    terminal: Box<dyn HostTerminal>,
    filter: Box<dyn TerminalFilter>,
) -> (RelayHandle, JoinHandle<Result<Farewell>>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (session, control) = Session::new(config, Arc::new(RejectDispatcher), sink_tx);
    let bridge = tokio::spawn(bridge_terminal(terminal, filter, control.clone(), sink_rx));
    let handle = RelayHandle {
        control: control.clone(),
    };
    let task = tokio::spawn(async move {
        let result = session.run(io).await;
        bridge.abort();
        result
    });
    (handle, task)
}

/// Pump the host terminal against the wire. Simple-mode filtering is
/// decided by the legacy side's Hello flag: the relay owns the PTY
/// output before it is framed, so the filter runs here.
async fn bridge_terminal(
    mut terminal: Box<dyn HostTerminal>,
    mut filter: Box<dyn TerminalFilter>,
    control: SessionControl,
    mut events: mpsc::UnboundedReceiver<TerminalEvent>,
) {
    let Ok(peer) = control.established().await else {
        return;
    };
    let simple = peer.flags.simple();
    let tx = control.terminal();
    let mut filtered = Vec::new();

    loop {
        tokio::select! {
            chunk = terminal.read_output() => match chunk {
                Ok(data) if data.is_empty() => {
                    control.shutdown(GoodbyeReason::Normal, "host terminal closed");
                    return;
                }
                Ok(data) => {
                    let payload = if simple {
                        filtered.clear();
                        filter.filter(&data, &mut filtered);
                        Bytes::copy_from_slice(&filtered)
                    } else {
                        data
                    };
                    if tx.send_output(payload).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug_warn!("host terminal read failed: {}", err);
                    control.shutdown(GoodbyeReason::Normal, "host terminal error");
                    return;
                }
            },
            event = events.recv() => match event {
                Some(TerminalEvent::Input(data)) => {
                    if terminal.write_input(&data).await.is_err() {
                        control.shutdown(GoodbyeReason::Normal, "host terminal closed");
                        return;
                    }
                }
                Some(TerminalEvent::Resize { cols, rows }) => {
                    let _ = terminal.resize(cols, rows).await;
                }
                Some(TerminalEvent::Output(_)) => {}
                None => return,
            },
        }
    }
}

/// One live Execute stream, streaming chunks until the exit report.
pub struct ExecStream {
    stream: OpenedStream,
}

/// What an Execute stream yields.
#[derive(Debug)]
pub enum ExecEvent {
    Chunk(ExecChannel, Bytes),
    Exited {
        status: EndStatus,
        detail: Option<u32>,
    },
}

impl ExecStream {
    /// Next output chunk or the exit report; the exit report is final.
    pub async fn next(&mut self) -> OpResult<ExecEvent> {
        loop {
            match self.stream.events.recv().await {
                Some(StreamEvent::Data(body)) => {
                    let (channel, data) =
                        decode_exec_chunk(&body).map_err(|e| OpError::Protocol(e.to_string()))?;
                    return Ok(ExecEvent::Chunk(channel, data));
                }
                Some(StreamEvent::End { status, trailer }) => {
                    return Ok(ExecEvent::Exited {
                        status,
                        detail: decode_exit_detail(&trailer),
                    });
                }
                Some(StreamEvent::Error { code, message }) => {
                    return Err(OpError::Failed { code, message });
                }
                Some(StreamEvent::Cancel) => continue,
                None => return Err(OpError::SessionClosed),
            }
        }
    }

    /// Ask the node to stop the child. The stream still delivers its
    /// final word (normally Exited with status Cancelled).
    pub fn cancel(&self) {
        let _ = self.stream.handle.cancel();
    }
}

/// Everything a command produced, for callers that do not stream.
#[derive(Debug)]
pub struct ExecOutcome {
    pub status: EndStatus,
    pub detail: Option<u32>,
    pub chunks: Vec<(ExecChannel, Bytes)>,
}

/// The tool-call adapter's view of the session. Cloneable; every method
/// opens one stream, drains it, and returns the assembled result.
#[derive(Clone)]
pub struct RelayHandle {
    control: SessionControl,
}

impl RelayHandle {
    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    /// Open + drain a reply-only stream.
    async fn collect(&self, request: OpenRequest) -> OpResult<Vec<Bytes>> {
        let mut stream = self.control.open(request).await?;
        let mut chunks = Vec::new();
        loop {
            match stream.events.recv().await {
                Some(StreamEvent::Data(body)) => chunks.push(body),
                Some(StreamEvent::End { status, .. }) => {
                    return match status {
                        EndStatus::Ok => Ok(chunks),
                        EndStatus::Cancelled => Err(OpError::Failed {
                            code: ErrorCode::Cancelled,
                            message: String::new(),
                        }),
                        other => Err(OpError::Protocol(format!(
                            "unexpected end status: {}",
                            other
                        ))),
                    };
                }
                Some(StreamEvent::Error { code, message }) => {
                    return Err(OpError::Failed { code, message });
                }
                Some(StreamEvent::Cancel) => continue,
                None => return Err(OpError::SessionClosed),
            }
        }
    }

    /// The single Data packet streams reply with, already concatenated.
    async fn collect_one(&self, request: OpenRequest) -> OpResult<Vec<u8>> {
        let chunks = self.collect(request).await?;
        Ok(chunks.concat())
    }

    pub async fn read_file(&self, path: &[u8]) -> OpResult<Vec<u8>> {
        self.collect_one(OpenRequest::FileRead { path: path.to_vec() })
            .await
    }

    /// Create/truncate `path` and write `data`. Mode 0 means the
    /// node-side default.
    pub async fn write_file(&self, path: &[u8], data: &[u8], mode: u32) -> OpResult<()> {
        let mut stream = self
            .control
            .open(OpenRequest::FileWrite {
                path: path.to_vec(),
                mode,
            })
            .await?;
        let chunk_size = stream.handle.max_chunk().max(1);
        for chunk in data.chunks(chunk_size) {
            stream
                .handle
                .send_data(Bytes::copy_from_slice(chunk))
                .await
                .map_err(|_| OpError::SessionClosed)?;
        }
        stream
            .handle
            .finish(EndStatus::Ok, Bytes::new())
            .map_err(|_| OpError::SessionClosed)?;

        loop {
            match stream.events.recv().await {
                Some(StreamEvent::End { status: EndStatus::Ok, .. }) => return Ok(()),
                Some(StreamEvent::End { status, .. }) => {
                    return Err(OpError::Protocol(format!("write ended {}", status)));
                }
                Some(StreamEvent::Error { code, message }) => {
                    return Err(OpError::Failed { code, message });
                }
                Some(_) => continue,
                None => return Err(OpError::SessionClosed),
            }
        }
    }

    pub async fn stat(&self, path: &[u8]) -> OpResult<StatReply> {
        let raw = self
            .collect_one(OpenRequest::Stat { path: path.to_vec() })
            .await?;
        StatReply::decode(&raw).map_err(|e| OpError::Protocol(e.to_string()))
    }

    pub async fn lstat(&self, path: &[u8]) -> OpResult<StatReply> {
        let raw = self
            .collect_one(OpenRequest::Lstat { path: path.to_vec() })
            .await?;
        StatReply::decode(&raw).map_err(|e| OpError::Protocol(e.to_string()))
    }

    pub async fn exists(&self, path: &[u8]) -> OpResult<bool> {
        let raw = self
            .collect_one(OpenRequest::Exists { path: path.to_vec() })
            .await?;
        match raw.as_slice() {
            [flag] => Ok(*flag != 0),
            _ => Err(OpError::Protocol("exists reply is not one byte".to_string())),
        }
    }

    pub async fn make_dir(&self, path: &[u8]) -> OpResult<()> {
        self.collect(OpenRequest::MakeDir { path: path.to_vec() })
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, path: &[u8]) -> OpResult<()> {
        self.collect(OpenRequest::Remove { path: path.to_vec() })
            .await
            .map(|_| ())
    }

    pub async fn rename(&self, src: &[u8], dst: &[u8]) -> OpResult<()> {
        self.collect(OpenRequest::Move {
            src: src.to_vec(),
            dst: dst.to_vec(),
        })
        .await
        .map(|_| ())
    }

    pub async fn resolve_path(&self, path: &[u8]) -> OpResult<Vec<u8>> {
        let mut raw = self
            .collect_one(OpenRequest::ResolvePath { path: path.to_vec() })
            .await?;
        if raw.last() == Some(&0) {
            raw.pop();
        }
        Ok(raw)
    }

    pub async fn list_dir(&self, path: &[u8]) -> OpResult<Vec<DirEntryReply>> {
        let chunks = self
            .collect(OpenRequest::ListDir { path: path.to_vec() })
            .await?;
        chunks
            .iter()
            .map(|c| DirEntryReply::decode(c).map_err(|e| OpError::Protocol(e.to_string())))
            .collect()
    }

    pub async fn glob_find(&self, base: &[u8], pattern: &[u8]) -> OpResult<Vec<Vec<u8>>> {
        let chunks = self
            .collect(OpenRequest::GlobFind {
                base: base.to_vec(),
                pattern: pattern.to_vec(),
            })
            .await?;
        Ok(chunks
            .iter()
            .map(|c| {
                let mut path = c.to_vec();
                if path.last() == Some(&0) {
                    path.pop();
                }
                path
            })
            .collect())
    }

    pub async fn search(
        &self,
        base: &[u8],
        needle: &[u8],
        file_pattern: Option<&[u8]>,
    ) -> OpResult<Vec<SearchHit>> {
        let chunks = self
            .collect(OpenRequest::Search {
                base: base.to_vec(),
                needle: needle.to_vec(),
                file_pattern: file_pattern.map(|p| p.to_vec()),
            })
            .await?;
        chunks
            .iter()
            .map(|c| SearchHit::decode(c).map_err(|e| OpError::Protocol(e.to_string())))
            .collect()
    }

    /// Start a command and stream its output.
    pub async fn execute(&self, command: &[u8]) -> OpResult<ExecStream> {
        let stream = self
            .control
            .open(OpenRequest::Execute {
                command: command.to_vec(),
            })
            .await?;
        Ok(ExecStream { stream })
    }

    /// Run a command to completion and return everything at once.
    pub async fn execute_collect(&self, command: &[u8]) -> OpResult<ExecOutcome> {
        let mut exec = self.execute(command).await?;
        let mut chunks = Vec::new();
        loop {
            match exec.next().await? {
                ExecEvent::Chunk(channel, data) => chunks.push((channel, data)),
                ExecEvent::Exited { status, detail } => {
                    return Ok(ExecOutcome {
                        status,
                        detail,
                        chunks,
                    });
                }
            }
        }
    }
}

/// Config for the standalone relay binary.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub recv_window: u32,
    pub log: bool,
}

/// Serve one legacy connection at a time over this process's stdio
/// terminal surface, until Ctrl-C. Connections that fail the first-byte
/// sniff are told goodbye and dropped without a session.
pub async fn run_relay(config: RelayConfig) -> Result<Farewell> {
    let listener = TcpListener::bind(&config.bind).await?;
    debug_log!("relay listening on {}", config.bind);
    tracing::info!(bind = %config.bind, "relay listening");

    loop {
        let (mut stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        debug_log!("accepted connection from {}", addr);

        if !sniff_hello(&mut stream).await {
            // A text-framed ancestor or random noise; say why and move on.
            let bye = Packet::goodbye(GoodbyeReason::ProtocolError, "unrecognized protocol");
            let _ = stream.write_all(&encode_raw(&bye)).await;
            continue;
        }

        let mut session_config = SessionConfig::relay().recv_window(config.recv_window);
        if config.log {
            let trace = TraceLog::open()?;
            eprintln!("kakehashi: protocol trace at {}", trace.path().display());
            session_config = session_config.trace(Arc::new(trace));
        }

        let (handle, mut task) = start(
            stream,
            session_config,
            Box::new(StdioTerminal::new()),
            Box::new(IdentityFilter),
        );

        tokio::select! {
            finished = &mut task => {
                return finished.expect("session task panicked");
            }
            _ = tokio::signal::ctrl_c() => {
                handle.control().shutdown(GoodbyeReason::Shutdown, "relay shutting down");
                return task.await.expect("session task panicked");
            }
        }
    }
}

/// Peek the first byte without consuming it: Hello's type code is 0x00,
/// and nothing in the old text framing starts with a NUL.
async fn sniff_hello(stream: &mut tokio::net::TcpStream) -> bool {
    let mut first = [0u8; 1];
    match tokio::time::timeout(std::time::Duration::from_secs(10), stream.peek(&mut first)).await {
        Ok(Ok(1)) => first[0] == 0x00,
        _ => false,
    }
}

/// Frame one packet without a codec in hand.
fn encode_raw(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + packet.payload.len());
    out.push(packet.kind.code());
    out.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&packet.payload);
    out
}
