//! Per-connection credit windows.
//!
//! The sender half: `FlowControl` tracks how many flow-controlled bytes
//! are in flight toward the peer and parks senders until WindowUpdate
//! credit arrives. The receiver half: `AckCounter` accumulates consumed
//! bytes until they are worth announcing.
//!
//! Only stream data (past the id prefix) and terminal bytes count.
//! Control packets are never gated, so a stalled window cannot wedge
//! cancellation or the farewell.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Reserving credit can fail only because the connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGone;

/// Sender-side credit tracking. The window starts at zero and is
/// installed once the handshake learns the peer's advertisement, which
/// conveniently parks any eager sender until the session is established.
#[derive(Debug)]
pub struct FlowControl {
    state: Mutex<FlowState>,
    notify: Notify,
}

#[derive(Debug)]
struct FlowState {
    window: u64,
    in_flight: u64,
    poisoned: bool,
}

impl FlowControl {
    pub fn new() -> Arc<FlowControl> {
        Arc::new(FlowControl {
            state: Mutex::new(FlowState {
                window: 0,
                in_flight: 0,
                poisoned: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Install the peer's advertised window. Called once at handshake.
    pub fn install_window(&self, window: u32) {
        let mut state = self.state.lock();
        state.window = window as u64;
        drop(state);
        self.notify.notify_waiters();
    }

    /// The peer's advertised window; zero before the handshake.
    pub fn window(&self) -> u64 {
        self.state.lock().window
    }

    pub fn in_flight(&self) -> u64 {
        self.state.lock().in_flight
    }

    /// Wait until `n` bytes fit under the peer's window, then claim them.
    /// Claims are indivisible: the caller must not split one packet's
    /// payload across two reservations.
    pub async fn reserve(&self, n: usize) -> Result<(), SessionGone> {
        if n == 0 {
            return if self.state.lock().poisoned {
                Err(SessionGone)
            } else {
                Ok(())
            };
        }
        let n = n as u64;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the check so a credit landing in
            // between cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.poisoned {
                    return Err(SessionGone);
                }
                if state.in_flight + n <= state.window {
                    state.in_flight += n;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Apply a WindowUpdate increment from the peer. Fails when the peer
    /// credits more than is actually outstanding.
    pub fn credit(&self, n: u32) -> Result<(), CreditError> {
        let mut state = self.state.lock();
        match state.in_flight.checked_sub(n as u64) {
            Some(rest) => {
                state.in_flight = rest;
                drop(state);
                self.notify.notify_waiters();
                Ok(())
            }
            None => Err(CreditError::Overflow),
        }
    }

    /// Hand back a claim whose bytes never reached the wire (the stream
    /// closed between reservation and emission). Unlike `credit` this is
    /// a local correction, so it saturates instead of failing.
    pub fn release(&self, n: usize) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(n as u64);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Kill every pending and future reservation. Called when the
    /// connection is torn down for any reason.
    pub fn poison(&self) {
        self.state.lock().poisoned = true;
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditError {
    Overflow,
}

/// Threshold for announcing consumed receive credit back to the peer.
pub const ACK_THRESHOLD: u64 = 8 * 1024;

/// Receiver-side consumption counter. Owned by the session loop; not
/// shared.
#[derive(Debug, Default)]
pub struct AckCounter {
    pending: u64,
}

impl AckCounter {
    pub fn new() -> AckCounter {
        AckCounter { pending: 0 }
    }

    /// Record `n` consumed bytes; returns an increment to send when the
    /// threshold is crossed.
    pub fn consume(&mut self, n: usize) -> Option<u32> {
        self.pending += n as u64;
        if self.pending >= ACK_THRESHOLD {
            self.drain()
        } else {
            None
        }
    }

    /// Flush whatever is pending, threshold or not. Used at stream
    /// completion so a finished transfer never strands credit.
    pub fn drain(&mut self) -> Option<u32> {
        if self.pending == 0 {
            return None;
        }
        // Window bounds cap pending far below u32::MAX, but saturate
        // anyway rather than truncate.
        let increment = u32::try_from(self.pending).unwrap_or(u32::MAX);
        self.pending -= increment as u64;
        Some(increment)
    }
}
