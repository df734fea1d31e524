//! The stream table.
//!
//! An arena keyed by stream id: the session loop owns the table and is
//! the only code that mutates it. Entries hold the handler's event feed
//! and task handle so that removing an entry is sufficient to release
//! everything the stream pinned down.

use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use kakehashi_wire::OperationKind;

use super::session::EndpointRole;
use super::stream::{StreamEvent, StreamState};

/// Cap on concurrently live streams per connection.
pub const MAX_LIVE_STREAMS: usize = 256;

#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub kind: OperationKind,
    pub state: StreamState,
    /// Initiated by this side.
    pub local: bool,
    pub events: mpsc::UnboundedSender<StreamEvent>,
    pub task: Option<JoinHandle<()>>,
    /// Peer cancelled; we owe them an End(Cancelled) and drop further
    /// outbound data meanwhile.
    pub cancel_pending: bool,
    /// We cancelled; the peer owes us a final End.
    pub cancel_sent: bool,
    pub last_activity: Instant,
}

impl StreamEntry {
    pub fn new(
        kind: OperationKind,
        local: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> StreamEntry {
        // A kind without a request body starts with the opener's half
        // already closed: the Open packet is the whole request.
        let state = if kind.has_request_body() {
            StreamState::Open
        } else if local {
            StreamState::HalfClosedLocal
        } else {
            StreamState::HalfClosedRemote
        };
        StreamEntry {
            kind,
            state,
            local,
            events,
            task: None,
            cancel_pending: false,
            cancel_sent: false,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Abort the handler task, if one is still running. Handler state
    /// (open files, children spawned with kill_on_drop) unwinds with it.
    pub fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Multiplexer {
    streams: FnvHashMap<u32, StreamEntry>,
    next_id: u32,
    local_parity: u32,
    max_live: usize,
}

impl Multiplexer {
    pub fn new(role: EndpointRole, max_live: usize) -> Multiplexer {
        let first = role.first_stream_id();
        Multiplexer {
            streams: FnvHashMap::default(),
            next_id: first,
            local_parity: first % 2,
            max_live,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_full(&self) -> bool {
        self.streams.len() >= self.max_live
    }

    /// Claim the next id of our parity. Ids are not reused; the counter
    /// marches upward for the life of the connection.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(2);
        id
    }

    /// Whether an id belongs to this side's parity.
    pub fn is_local_id(&self, id: u32) -> bool {
        id % 2 == self.local_parity
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn insert(&mut self, id: u32, entry: StreamEntry) {
        debug_assert!(!self.streams.contains_key(&id));
        self.streams.insert(id, entry);
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut StreamEntry> {
        self.streams.get_mut(&id)
    }

    /// Drop an entry, releasing its handler.
    pub fn remove(&mut self, id: u32) -> Option<StreamEntry> {
        let mut entry = self.streams.remove(&id)?;
        entry.release();
        Some(entry)
    }

    /// Ids whose last activity is older than `timeout`.
    pub fn idle_ids(&self, timeout: Duration) -> Vec<u32> {
        let now = Instant::now();
        self.streams
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Tear every stream down; used when the connection dies.
    pub fn drain(&mut self) -> Vec<(u32, StreamEntry)> {
        let mut all: Vec<(u32, StreamEntry)> = self.streams.drain().collect();
        for (_, entry) in all.iter_mut() {
            entry.release();
        }
        all
    }
}
