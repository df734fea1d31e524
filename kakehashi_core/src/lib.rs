//! Session engine for the Kakehashi remote bridge.
//!
//! A single TCP connection carries an interactive terminal session plus
//! multiplexed operation streams between a Host Agent relay and a legacy
//! machine. This crate implements both endpoints of that wire: the
//! framing-fed session loop with its stream table and credit windows,
//! the legacy-side operation handlers, and the relay-side tool-call and
//! terminal bridges. The byte-exact wire definitions live in
//! `kakehashi_wire`.

pub mod connection;
pub mod debug;
pub mod node;
pub mod ops;
pub mod relay;
pub mod terminal;
pub mod trace;

pub use connection::error::{ConnectionError, Result};
pub use connection::session::{
    EndpointRole, Farewell, PeerInfo, Session, SessionConfig, SessionControl,
};
pub use connection::stream::{OpError, OpResult, StreamEvent, StreamHandle, StreamIo};

pub use node::{NodeConfig, run_node};
pub use ops::{NodeDispatcher, OperationDispatcher, RejectDispatcher};
pub use relay::{
    ExecEvent, ExecOutcome, ExecStream, HostTerminal, IdentityFilter, RelayConfig, RelayHandle,
    StdioTerminal, TerminalFilter, run_relay,
};
pub use terminal::{TerminalEvent, TerminalTx};
pub use trace::TraceLog;

pub use kakehashi_wire as wire;
