//! Kakehashi: a bridge between a modern Host Agent and a legacy machine's
//! terminal, multiplexed over a single TCP connection.
//!
//! The legacy side runs `kakehashi_node`, which displays the Host Agent's
//! terminal UI and serves file, search and process operations against the
//! legacy machine. The Host Agent side runs the relay, which owns the
//! agent's PTY and turns tool calls into operation streams.

pub use kakehashi_core::connection::error::{ConnectionError, Result};
pub use kakehashi_core::connection::session::{
    EndpointRole, Farewell, PeerInfo, Session, SessionConfig, SessionControl,
};
pub use kakehashi_core::connection::stream::{OpError, OpResult, StreamEvent, StreamHandle};

pub use kakehashi_core::node::{NodeConfig, run_node};
pub use kakehashi_core::ops::{NodeDispatcher, OperationDispatcher, RejectDispatcher};
pub use kakehashi_core::relay::{
    ExecEvent, ExecOutcome, ExecStream, HostTerminal, IdentityFilter, RelayConfig, RelayHandle,
    StdioTerminal, TerminalFilter, run_relay, start as start_relay,
};
pub use kakehashi_core::terminal::{TerminalEvent, TerminalTx};
pub use kakehashi_core::trace::TraceLog;

pub use kakehashi_wire::{
    DirEntryReply, EndStatus, EntryKind, ExecChannel, Goodbye, GoodbyeReason, Hello, HelloAck,
    OpenRequest, OperationKind, PROTOCOL_VERSION, Packet, PacketType, SearchHit, SessionFlags,
    StatReply, WireCodec,
};

pub use kakehashi_core;
pub use kakehashi_wire;
