//! Stream-facing types: the per-stream state machine, the events a
//! handler receives, and the emit handle a handler holds.
//!
//! A handler never touches the socket or the stream table. It owns an id,
//! a command sender back into the session loop, and a share of the flow
//! controller, nothing else. Dropping the table entry can never leave a
//! reference cycle behind.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use kakehashi_wire::{EndStatus, ErrorCode, GoodbyeReason, OpenRequest};

use super::flow::{FlowControl, SessionGone};

/// Largest body a handler puts in one StreamData packet. The effective
/// chunk is further clamped to the peer's window so a single packet can
/// always clear flow control.
pub const DATA_CHUNK: usize = 64 * 1024;

/// Stream lifecycle. `Idle` is implicit: no table entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// May the peer still send payload on this stream?
    pub fn peer_may_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// May this side still send payload?
    pub fn local_may_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// The state after this side finishes sending.
    pub fn after_local_end(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            _ => StreamState::Closed,
        }
    }

    /// The state after the peer finishes sending.
    pub fn after_remote_end(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        }
    }
}

/// What the session loop delivers to a stream's handler.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Bytes),
    End { status: EndStatus, trailer: Bytes },
    Error { code: ErrorCode, message: String },
    Cancel,
}

/// Commands funneled from handlers, terminal pumps and control handles
/// into the session loop, which is the only place that writes the socket
/// or mutates the stream table.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Data {
        id: u32,
        body: Bytes,
    },
    End {
        id: u32,
        status: EndStatus,
        trailer: Bytes,
    },
    Fail {
        id: u32,
        code: ErrorCode,
        message: String,
    },
    Open {
        request: OpenRequest,
        reply: oneshot::Sender<Result<OpenedStream, OpError>>,
    },
    Cancel {
        id: u32,
    },
    TerminalInput(Bytes),
    TerminalOutput(Bytes),
    Resize {
        cols: u16,
        rows: u16,
    },
    Shutdown {
        reason: GoodbyeReason,
        message: String,
    },
}

/// How a locally driven operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// The stream failed with a structured wire error.
    Failed { code: ErrorCode, message: String },
    /// The session went away underneath the call.
    SessionClosed,
    /// The peer answered with bytes that do not parse as the expected
    /// reply layout.
    Protocol(String),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { code, message } if message.is_empty() => write!(f, "{}", code),
            Self::Failed { code, message } => write!(f, "{}: {}", code, message),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Protocol(msg) => write!(f, "malformed reply: {}", msg),
        }
    }
}

impl std::error::Error for OpError {}

pub type OpResult<T> = std::result::Result<T, OpError>;

/// A stream opened from this side, as handed to the caller: the id, the
/// emit handle, and the inbound event feed.
#[derive(Debug)]
pub struct OpenedStream {
    pub id: u32,
    pub handle: StreamHandle,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Emit handle held by a handler (or a relay-side collector).
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: u32,
    commands: mpsc::UnboundedSender<SessionCommand>,
    flow: Arc<FlowControl>,
}

impl StreamHandle {
    pub(crate) fn new(
        id: u32,
        commands: mpsc::UnboundedSender<SessionCommand>,
        flow: Arc<FlowControl>,
    ) -> StreamHandle {
        StreamHandle { id, commands, flow }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Chunk size that is guaranteed to clear the peer's window.
    pub fn max_chunk(&self) -> usize {
        DATA_CHUNK.min(self.flow.window().max(1) as usize)
    }

    /// Ship one Data packet's body, waiting for window credit first.
    pub async fn send_data(&self, body: Bytes) -> Result<(), SessionGone> {
        self.flow.reserve(body.len()).await?;
        self.commands
            .send(SessionCommand::Data { id: self.id, body })
            .map_err(|_| SessionGone)
    }

    /// Close our half of the stream.
    pub fn finish(&self, status: EndStatus, trailer: Bytes) -> Result<(), SessionGone> {
        self.commands
            .send(SessionCommand::End {
                id: self.id,
                status,
                trailer,
            })
            .map_err(|_| SessionGone)
    }

    /// Fail the stream with a structured error.
    pub fn fail(&self, code: ErrorCode, message: &str) -> Result<(), SessionGone> {
        self.commands
            .send(SessionCommand::Fail {
                id: self.id,
                code,
                message: message.to_string(),
            })
            .map_err(|_| SessionGone)
    }

    /// Ask the peer to stop serving this stream (initiator side).
    pub fn cancel(&self) -> Result<(), SessionGone> {
        self.commands
            .send(SessionCommand::Cancel { id: self.id })
            .map_err(|_| SessionGone)
    }
}

/// Everything a spawned operation handler gets.
#[derive(Debug)]
pub struct StreamIo {
    pub handle: StreamHandle,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}
