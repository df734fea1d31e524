//! The terminal channel.
//!
//! A distinguished, unmultiplexed channel for the interactive session:
//! keystrokes travel node → relay as TerminalInput, the Host Agent's
//! screen bytes travel relay → node as TerminalOutput, and the node
//! reports geometry changes with TerminalResize. No stream id is spent
//! on any of it, but the bytes consume window credit exactly as stream
//! data does.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::flow::{FlowControl, SessionGone};
use crate::connection::stream::SessionCommand;

/// Terminal traffic delivered out of the session loop.
#[derive(Debug)]
pub enum TerminalEvent {
    /// Keystrokes from the legacy user (seen on the relay).
    Input(Bytes),
    /// Screen bytes from the Host Agent (seen on the node).
    Output(Bytes),
    /// New geometry of the legacy terminal (seen on the relay).
    Resize { cols: u16, rows: u16 },
}

/// Send half of the terminal channel. Cloneable; each payload waits for
/// window credit before entering the session loop.
#[derive(Debug, Clone)]
pub struct TerminalTx {
    commands: mpsc::UnboundedSender<SessionCommand>,
    flow: Arc<FlowControl>,
}

impl TerminalTx {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<SessionCommand>,
        flow: Arc<FlowControl>,
    ) -> TerminalTx {
        TerminalTx { commands, flow }
    }

    /// Ship keystrokes toward the relay.
    pub async fn send_input(&self, data: Bytes) -> Result<(), SessionGone> {
        self.flow.reserve(data.len()).await?;
        self.commands
            .send(SessionCommand::TerminalInput(data))
            .map_err(|_| SessionGone)
    }

    /// Ship screen bytes toward the node.
    pub async fn send_output(&self, data: Bytes) -> Result<(), SessionGone> {
        self.flow.reserve(data.len()).await?;
        self.commands
            .send(SessionCommand::TerminalOutput(data))
            .map_err(|_| SessionGone)
    }

    /// Announce new terminal geometry. Not flow controlled: four bytes
    /// of control payload, and stalling a resize behind a full window
    /// would garble the redraw it exists to trigger.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionGone> {
        self.commands
            .send(SessionCommand::Resize { cols, rows })
            .map_err(|_| SessionGone)
    }
}
