//! The per-connection session engine.
//!
//! One loop task owns the socket's write half, the stream table and both
//! credit counters. Everything else (operation handlers, terminal pumps,
//! the relay's tool-call handles) funnels commands into the loop over a
//! channel and never touches the socket, so two packets can never
//! interleave mid-frame and per-stream ordering falls out of the channel
//! ordering. Handlers wait on flow-control credit *before* enqueueing
//! payload, which keeps the loop itself free of suspension points other
//! than socket readiness.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::codec::{FramedRead, FramedWrite};

use kakehashi_wire::codec::FrameError;
use kakehashi_wire::{
    DEFAULT_WINDOW, EndStatus, ErrorCode, Goodbye, GoodbyeReason, Hello, HelloAck, MAX_WINDOW,
    MIN_WINDOW, NODE_MAX_PACKET, OpenRequest, PROTOCOL_VERSION, Packet, PacketType,
    RELAY_MAX_PACKET, SessionFlags, WireCodec, meta,
};

use crate::ops::OperationDispatcher;
use crate::terminal::{TerminalEvent, TerminalTx};
use crate::trace::{Direction, TraceLog};
use crate::{debug_log, debug_warn};

use super::error::{ConnectionError, Result};
use super::flow::{AckCounter, FlowControl};
use super::mux::{MAX_LIVE_STREAMS, Multiplexer, StreamEntry};
use super::stream::{OpError, OpenedStream, SessionCommand, StreamEvent, StreamHandle, StreamIo};

/// Which end of the bridge this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// The legacy-side endpoint: dials, speaks Hello first, owns the
    /// filesystem and processes. Initiates odd-numbered streams.
    Node,
    /// The Host-Agent-side relay: accepts, answers HelloAck, drives
    /// most operations. Initiates even-numbered streams.
    Relay,
}

impl EndpointRole {
    pub fn first_stream_id(self) -> u32 {
        match self {
            EndpointRole::Node => 1,
            EndpointRole::Relay => 2,
        }
    }
}

/// Per-session tunables. Constructed through `node()`/`relay()` and then
/// adjusted builder-style.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: EndpointRole,
    pub flags: SessionFlags,
    pub recv_window: u32,
    pub max_packet: u32,
    pub max_streams: usize,
    /// Announced in Hello by the node; resolves the handlers' relative
    /// paths. Unused on the relay.
    pub cwd: Vec<u8>,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_deadline: Duration,
    pub idle_stream_timeout: Option<Duration>,
    pub trace: Option<Arc<TraceLog>>,
}

impl SessionConfig {
    pub fn node(cwd: Vec<u8>) -> SessionConfig {
        SessionConfig {
            role: EndpointRole::Node,
            flags: SessionFlags::new(),
            recv_window: DEFAULT_WINDOW,
            max_packet: NODE_MAX_PACKET,
            max_streams: MAX_LIVE_STREAMS,
            cwd,
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(300),
            keepalive_deadline: Duration::from_secs(10),
            idle_stream_timeout: Some(Duration::from_secs(300)),
            trace: None,
        }
    }

    pub fn relay() -> SessionConfig {
        SessionConfig {
            max_packet: RELAY_MAX_PACKET,
            role: EndpointRole::Relay,
            ..SessionConfig::node(b"/".to_vec())
        }
    }

    pub fn flags(mut self, flags: SessionFlags) -> SessionConfig {
        self.flags = flags;
        self
    }

    pub fn recv_window(mut self, window: u32) -> SessionConfig {
        self.recv_window = window.clamp(MIN_WINDOW, MAX_WINDOW);
        self
    }

    pub fn idle_stream_timeout(mut self, timeout: Option<Duration>) -> SessionConfig {
        self.idle_stream_timeout = timeout;
        self
    }

    pub fn trace(mut self, trace: Arc<TraceLog>) -> SessionConfig {
        self.trace = Some(trace);
        self
    }
}

/// What the handshake learned about the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: u16,
    pub flags: SessionFlags,
    pub window: u32,
    /// The node's announced working directory; None on the node side.
    pub cwd: Option<Vec<u8>>,
}

/// How the session ended, when it ended with a Goodbye rather than an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Farewell {
    pub reason: GoodbyeReason,
    pub message: String,
    pub from_peer: bool,
}

/// Cloneable handle for everything outside the loop: opening streams,
/// the terminal channel, shutdown.
#[derive(Debug, Clone)]
pub struct SessionControl {
    commands: mpsc::UnboundedSender<SessionCommand>,
    flow: Arc<FlowControl>,
    established: watch::Receiver<Option<PeerInfo>>,
}

impl SessionControl {
    /// Wait until the handshake has completed and report the peer.
    pub async fn established(&self) -> std::result::Result<PeerInfo, OpError> {
        let mut rx = self.established.clone();
        let guard = rx
            .wait_for(|info| info.is_some())
            .await
            .map_err(|_| OpError::SessionClosed)?;
        Ok(guard.clone().expect("guarded by wait_for"))
    }

    /// The terminal channel's send half.
    pub fn terminal(&self) -> TerminalTx {
        TerminalTx::new(self.commands.clone(), self.flow.clone())
    }

    /// Open a stream toward the peer. Resolves once the loop has
    /// allocated an id and put the Open on the wire.
    pub async fn open(&self, request: OpenRequest) -> std::result::Result<OpenedStream, OpError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(SessionCommand::Open {
                request,
                reply: reply_tx,
            })
            .map_err(|_| OpError::SessionClosed)?;
        reply_rx.await.map_err(|_| OpError::SessionClosed)?
    }

    /// Ask the peer to stop serving a stream we opened.
    pub fn cancel(&self, id: u32) {
        let _ = self.commands.send(SessionCommand::Cancel { id });
    }

    /// Send Goodbye and wind the session down.
    pub fn shutdown(&self, reason: GoodbyeReason, message: &str) {
        let _ = self.commands.send(SessionCommand::Shutdown {
            reason,
            message: message.to_string(),
        });
    }
}

/// A session ready to be driven over a transport.
pub struct Session {
    config: SessionConfig,
    dispatcher: Arc<dyn OperationDispatcher>,
    terminal_sink: mpsc::UnboundedSender<TerminalEvent>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    flow: Arc<FlowControl>,
    established_tx: watch::Sender<Option<PeerInfo>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        dispatcher: Arc<dyn OperationDispatcher>,
        terminal_sink: mpsc::UnboundedSender<TerminalEvent>,
    ) -> (Session, SessionControl) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let flow = FlowControl::new();
        let (established_tx, established_rx) = watch::channel(None);
        let control = SessionControl {
            commands: commands_tx.clone(),
            flow: flow.clone(),
            established: established_rx,
        };
        let session = Session {
            config,
            dispatcher,
            terminal_sink,
            commands_tx,
            commands_rx,
            flow,
            established_tx,
        };
        (session, control)
    }

    /// Drive the session over `io` until Goodbye or a fatal error. All
    /// streams are force-terminated on the way out, whatever the cause.
    pub async fn run<S>(self, io: S) -> Result<Farewell>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Session {
            config,
            dispatcher,
            terminal_sink,
            commands_tx,
            mut commands_rx,
            flow,
            established_tx,
        } = self;

        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = FramedRead::new(read_half, WireCodec::new(config.max_packet));
        let mut writer = FramedWrite::new(write_half, WireCodec::new(config.max_packet));

        let mut driver = Driver {
            mux: Multiplexer::new(config.role, config.max_streams),
            acks: AckCounter::new(),
            config,
            dispatcher,
            terminal_sink,
            commands_tx,
            flow,
            established_tx,
        };

        let result = driver
            .drive(&mut reader, &mut writer, &mut commands_rx)
            .await;

        // Unconditional teardown: no handler resource survives the
        // session, and parked senders must wake to see it gone.
        driver.flow.poison();
        for (_, _entry) in driver.mux.drain() {
            // Dropping the entry closes the event feed and aborts the
            // task; children spawned with kill_on_drop die with it.
        }

        if let Err(err) = &result {
            // Tell the peer why, if the socket is still writable.
            let farewell = Packet::goodbye(err.goodbye_reason(), &err.to_string());
            driver.record(Direction::Out, &farewell);
            let _ = writer.send(farewell).await;
        }
        let _ = writer.close().await;
        result
    }
}

/// Ping state while a reply is outstanding.
struct PendingPing {
    nonce: u64,
    deadline: Pin<Box<Sleep>>,
}

/// Loop-owned state plus the packet/command handlers.
struct Driver {
    config: SessionConfig,
    dispatcher: Arc<dyn OperationDispatcher>,
    terminal_sink: mpsc::UnboundedSender<TerminalEvent>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    flow: Arc<FlowControl>,
    established_tx: watch::Sender<Option<PeerInfo>>,
    mux: Multiplexer,
    acks: AckCounter,
}

impl Driver {
    fn record(&self, direction: Direction, packet: &Packet) {
        if let Some(trace) = &self.config.trace {
            trace.record(direction, packet);
        }
    }

    async fn send<W>(&self, writer: &mut W, packet: Packet) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        self.record(Direction::Out, &packet);
        writer.send(packet).await.map_err(ConnectionError::from)
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<Farewell>
    where
        R: Stream<Item = std::result::Result<Packet, FrameError>> + Unpin,
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        if let Some(farewell) = self.handshake(reader, writer).await? {
            return Ok(farewell);
        }

        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_period = Duration::from_secs(30);
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_inbound = Instant::now();
        let mut pending_ping: Option<PendingPing> = None;
        let mut ping_nonce: u64 = 0;

        loop {
            tokio::select! {
                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(packet)) => {
                            last_inbound = Instant::now();
                            self.record(Direction::In, &packet);
                            if let Some(farewell) =
                                self.handle_packet(writer, packet, &mut pending_ping).await?
                            {
                                return Ok(farewell);
                            }
                        }
                        Some(Err(err)) => return Err(err.into()),
                        None => return Err(ConnectionError::ConnectionClosed),
                    }
                }
                command = commands.recv() => {
                    // The loop holds its own sender, so recv cannot fail.
                    let command = command.expect("command channel closed");
                    if let Some(farewell) = self.handle_command(writer, command).await? {
                        return Ok(farewell);
                    }
                }
                _ = keepalive.tick() => {
                    if pending_ping.is_none()
                        && last_inbound.elapsed() >= self.config.keepalive_interval
                    {
                        ping_nonce += 1;
                        self.send(writer, Packet::ping(ping_nonce)).await?;
                        pending_ping = Some(PendingPing {
                            nonce: ping_nonce,
                            deadline: Box::pin(tokio::time::sleep(
                                self.config.keepalive_deadline,
                            )),
                        });
                    }
                }
                _ = async { pending_ping.as_mut().expect("guarded").deadline.as_mut().await },
                    if pending_ping.is_some() =>
                {
                    return Err(ConnectionError::KeepaliveTimeout);
                }
                _ = sweep.tick(), if self.config.idle_stream_timeout.is_some() => {
                    self.sweep_idle_streams(writer).await?;
                }
            }
        }
    }

    /// Hello/HelloAck exchange. Returns a farewell when the peer hangs
    /// up cleanly instead of completing the handshake.
    async fn handshake<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<Option<Farewell>>
    where
        R: Stream<Item = std::result::Result<Packet, FrameError>> + Unpin,
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        match self.config.role {
            EndpointRole::Node => {
                let hello = Hello {
                    version: PROTOCOL_VERSION,
                    flags: self.config.flags,
                    window: self.config.recv_window,
                    cwd: self.config.cwd.clone(),
                };
                self.send(writer, Packet::new(PacketType::Hello, hello.encode()))
                    .await?;

                let packet = self.await_packet(reader).await?;
                self.record(Direction::In, &packet);
                match packet.kind {
                    PacketType::HelloAck => {
                        let ack = HelloAck::decode(&packet.payload)?;
                        if ack.version != PROTOCOL_VERSION {
                            self.send(writer, Packet::goodbye(GoodbyeReason::VersionMismatch, ""))
                                .await?;
                            return Err(ConnectionError::UnsupportedProtocolVersion(ack.version));
                        }
                        self.establish(PeerInfo {
                            version: ack.version,
                            flags: ack.flags,
                            window: ack.window,
                            cwd: None,
                        });
                        Ok(None)
                    }
                    PacketType::Goodbye => {
                        let bye = Goodbye::decode(&packet.payload)?;
                        Ok(Some(Farewell {
                            reason: bye.reason,
                            message: bye.message,
                            from_peer: true,
                        }))
                    }
                    other => Err(ConnectionError::FirstPacketNotHello(other.code())),
                }
            }
            EndpointRole::Relay => {
                let packet = self.await_packet(reader).await?;
                self.record(Direction::In, &packet);
                if packet.kind != PacketType::Hello {
                    self.send(writer, Packet::goodbye(GoodbyeReason::ProtocolError, "expected Hello"))
                        .await?;
                    return Err(ConnectionError::FirstPacketNotHello(packet.kind.code()));
                }
                let hello = Hello::decode(&packet.payload)?;
                if hello.version != PROTOCOL_VERSION {
                    self.send(writer, Packet::goodbye(GoodbyeReason::VersionMismatch, ""))
                        .await?;
                    return Err(ConnectionError::UnsupportedProtocolVersion(hello.version));
                }
                let ack = HelloAck {
                    version: PROTOCOL_VERSION,
                    flags: self.config.flags,
                    window: self.config.recv_window,
                };
                self.send(writer, Packet::new(PacketType::HelloAck, ack.encode()))
                    .await?;
                self.establish(PeerInfo {
                    version: hello.version,
                    flags: hello.flags,
                    window: hello.window,
                    cwd: Some(hello.cwd),
                });
                Ok(None)
            }
        }
    }

    fn establish(&mut self, peer: PeerInfo) {
        debug_log!(
            "session established, peer window {} flags {:#06x}",
            peer.window,
            peer.flags.bits()
        );
        tracing::debug!(window = peer.window, "session established");
        self.flow.install_window(peer.window);
        let _ = self.established_tx.send(Some(peer));
    }

    async fn await_packet<R>(&self, reader: &mut R) -> Result<Packet>
    where
        R: Stream<Item = std::result::Result<Packet, FrameError>> + Unpin,
    {
        let next = tokio::time::timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?;
        match next {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(err)) => Err(err.into()),
            None => Err(ConnectionError::ConnectionClosed),
        }
    }

    async fn handle_packet<W>(
        &mut self,
        writer: &mut W,
        packet: Packet,
        pending_ping: &mut Option<PendingPing>,
    ) -> Result<Option<Farewell>>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        match packet.kind {
            PacketType::Hello | PacketType::HelloAck => Err(ConnectionError::ProtocolViolation(
                "handshake packet after establishment".to_string(),
            )),
            PacketType::Ping => {
                let nonce = kakehashi_wire::bootstrap::decode_nonce(&packet.payload)?;
                self.send(writer, Packet::pong(nonce)).await?;
                Ok(None)
            }
            PacketType::Pong => {
                let nonce = kakehashi_wire::bootstrap::decode_nonce(&packet.payload)?;
                if pending_ping.as_ref().is_some_and(|p| p.nonce == nonce) {
                    *pending_ping = None;
                }
                Ok(None)
            }
            PacketType::Goodbye => {
                let bye = Goodbye::decode(&packet.payload)?;
                Ok(Some(Farewell {
                    reason: bye.reason,
                    message: bye.message,
                    from_peer: true,
                }))
            }
            PacketType::TerminalInput => {
                self.ack(writer, packet.payload.len()).await?;
                let _ = self.terminal_sink.send(TerminalEvent::Input(packet.payload));
                Ok(None)
            }
            PacketType::TerminalOutput => {
                self.ack(writer, packet.payload.len()).await?;
                let _ = self
                    .terminal_sink
                    .send(TerminalEvent::Output(packet.payload));
                Ok(None)
            }
            PacketType::TerminalResize => {
                let (cols, rows) = kakehashi_wire::bootstrap::decode_resize(&packet.payload)?;
                let _ = self.terminal_sink.send(TerminalEvent::Resize { cols, rows });
                Ok(None)
            }
            PacketType::StreamOpen => {
                self.on_open(writer, &packet.payload).await?;
                Ok(None)
            }
            PacketType::StreamData => {
                self.on_data(writer, &packet.payload).await?;
                Ok(None)
            }
            PacketType::StreamEnd => {
                self.on_end(writer, &packet.payload).await?;
                Ok(None)
            }
            PacketType::StreamError => {
                self.on_error(&packet.payload)?;
                Ok(None)
            }
            PacketType::StreamCancel => {
                self.on_cancel(writer, &packet.payload).await?;
                Ok(None)
            }
            PacketType::WindowUpdate => {
                let increment = meta::parse_window_update(&packet.payload)?;
                self.flow
                    .credit(increment)
                    .map_err(|_| ConnectionError::CreditOverflow)?;
                Ok(None)
            }
        }
    }

    /// Count consumed receive credit and announce it at the threshold.
    async fn ack<W>(&mut self, writer: &mut W, consumed: usize) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        if let Some(increment) = self.acks.consume(consumed) {
            self.send(writer, Packet::window_update(increment)).await?;
        }
        Ok(())
    }

    /// Flush receive credit regardless of the threshold; used when a
    /// stream completes so its tail bytes never strand credit.
    async fn flush_acks<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        if let Some(increment) = self.acks.drain() {
            self.send(writer, Packet::window_update(increment)).await?;
        }
        Ok(())
    }

    async fn on_open<W>(&mut self, writer: &mut W, payload: &Bytes) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        // The id parses even when the metadata does not, so metadata
        // problems stay stream-local.
        let (id, _) = meta::split_stream_id(payload)?;

        if id == 0 || self.mux.is_local_id(id) {
            self.send(writer, Packet::stream_error(id, ErrorCode::Invalid, "bad stream id parity"))
                .await?;
            return Ok(());
        }
        if self.mux.contains(id) {
            // The existing stream is left alone; only the offending
            // Open is answered.
            self.send(writer, Packet::stream_error(id, ErrorCode::Invalid, "stream id in use"))
                .await?;
            return Ok(());
        }
        if self.mux.is_full() {
            self.send(writer, Packet::stream_error(id, ErrorCode::NoResources, "stream table full"))
                .await?;
            return Ok(());
        }

        let request = match meta::parse_open(payload) {
            Ok((_, request)) => request,
            Err(err) => {
                debug_warn!("rejecting malformed open on stream {}: {}", id, err);
                self.send(writer, Packet::stream_error(id, ErrorCode::Invalid, "malformed open metadata"))
                    .await?;
                return Ok(());
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut entry = StreamEntry::new(request.kind(), false, events_tx);
        let io = StreamIo {
            handle: StreamHandle::new(id, self.commands_tx.clone(), self.flow.clone()),
            events: events_rx,
        };
        match self.dispatcher.dispatch(request, io) {
            Ok(task) => {
                entry.task = Some(task);
                self.mux.insert(id, entry);
            }
            Err(code) => {
                self.send(writer, Packet::stream_error(id, code, "rejected"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_data<W>(&mut self, writer: &mut W, payload: &Bytes) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        let (id, body) = meta::split_stream_id(payload)?;
        // Consumed credit is acknowledged even when the stream is gone:
        // the bytes were sent against our window either way.
        self.ack(writer, body.len()).await?;

        let Some(entry) = self.mux.get_mut(id) else {
            return Ok(()); // crossed in flight with our close
        };
        if entry.cancel_sent || entry.cancel_pending {
            return Ok(());
        }
        if !entry.state.peer_may_send() {
            self.fail_stream(writer, id, ErrorCode::Invalid, "data after end")
                .await?;
            return Ok(());
        }
        entry.touch();
        // A send failure means the handler quit early; its final word
        // (or the entry teardown) deals with the peer.
        let _ = entry.events.send(StreamEvent::Data(body));
        Ok(())
    }

    async fn on_end<W>(&mut self, writer: &mut W, payload: &Bytes) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        let (id, status, trailer) = meta::parse_end(payload)?;
        self.flush_acks(writer).await?;

        let Some(entry) = self.mux.get_mut(id) else {
            return Ok(());
        };
        if entry.cancel_sent {
            // The final word after our cancel; whatever the status, the
            // stream is finished.
            let _ = entry.events.send(StreamEvent::End { status, trailer });
            self.mux.remove(id);
            return Ok(());
        }
        if !entry.state.peer_may_send() {
            self.fail_stream(writer, id, ErrorCode::Invalid, "end after end")
                .await?;
            return Ok(());
        }
        entry.touch();
        let _ = entry.events.send(StreamEvent::End { status, trailer });
        entry.state = entry.state.after_remote_end();
        if entry.state == super::stream::StreamState::Closed {
            self.mux.remove(id);
        }
        Ok(())
    }

    fn on_error(&mut self, payload: &Bytes) -> Result<()> {
        let (id, code, message) = meta::parse_error(payload)?;
        let Some(entry) = self.mux.get_mut(id) else {
            return Ok(());
        };
        let _ = entry.events.send(StreamEvent::Error { code, message });
        self.mux.remove(id);
        Ok(())
    }

    async fn on_cancel<W>(&mut self, writer: &mut W, payload: &Bytes) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        let id = meta::parse_cancel(payload)?;
        let Some(entry) = self.mux.get_mut(id) else {
            return Ok(());
        };
        entry.touch();
        entry.cancel_pending = true;
        if entry.events.send(StreamEvent::Cancel).is_err() {
            // Handler already gone; acknowledge the cancel ourselves.
            self.send(writer, Packet::stream_end(id, EndStatus::Cancelled, b""))
                .await?;
            self.mux.remove(id);
        }
        Ok(())
    }

    /// Report a stream-local protocol failure and drop the stream. The
    /// connection and its siblings carry on.
    async fn fail_stream<W>(
        &mut self,
        writer: &mut W,
        id: u32,
        code: ErrorCode,
        message: &str,
    ) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        if let Some(entry) = self.mux.get_mut(id) {
            let _ = entry.events.send(StreamEvent::Error {
                code,
                message: message.to_string(),
            });
        }
        self.mux.remove(id);
        self.send(writer, Packet::stream_error(id, code, message)).await
    }

    async fn handle_command<W>(
        &mut self,
        writer: &mut W,
        command: SessionCommand,
    ) -> Result<Option<Farewell>>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        match command {
            SessionCommand::Data { id, body } => {
                let live = self
                    .mux
                    .get_mut(id)
                    .map(|entry| {
                        entry.touch();
                        entry.state.local_may_send() && !entry.cancel_pending
                    })
                    .unwrap_or(false);
                if live {
                    self.send(writer, Packet::stream_data(id, &body)).await?;
                } else {
                    // The handler reserved credit for bytes that will
                    // never reach the wire; hand the claim back.
                    self.flow.release(body.len());
                }
                Ok(None)
            }
            SessionCommand::End { id, status, trailer } => {
                if self.mux.contains(id) {
                    self.send(writer, Packet::stream_end(id, status, &trailer))
                        .await?;
                    let entry = self.mux.get_mut(id).expect("checked above");
                    entry.state = entry.state.after_local_end();
                    let done = entry.state == super::stream::StreamState::Closed
                        || entry.cancel_pending;
                    if done {
                        self.mux.remove(id);
                    }
                }
                Ok(None)
            }
            SessionCommand::Fail { id, code, message } => {
                if self.mux.contains(id) {
                    self.send(writer, Packet::stream_error(id, code, &message))
                        .await?;
                    self.mux.remove(id);
                }
                Ok(None)
            }
            SessionCommand::Open { request, reply } => {
                if self.mux.is_full() {
                    let _ = reply.send(Err(OpError::Failed {
                        code: ErrorCode::NoResources,
                        message: "local stream table full".to_string(),
                    }));
                    return Ok(None);
                }
                let id = self.mux.allocate_id();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.mux
                    .insert(id, StreamEntry::new(request.kind(), true, events_tx));
                self.send(writer, request.open_packet(id)).await?;
                let opened = OpenedStream {
                    id,
                    handle: StreamHandle::new(id, self.commands_tx.clone(), self.flow.clone()),
                    events: events_rx,
                };
                if reply.send(Ok(opened)).is_err() {
                    // Caller vanished between asking and hearing back.
                    self.send(writer, Packet::stream_cancel(id)).await?;
                    if let Some(entry) = self.mux.get_mut(id) {
                        entry.cancel_sent = true;
                    }
                }
                Ok(None)
            }
            SessionCommand::Cancel { id } => {
                if let Some(entry) = self.mux.get_mut(id) {
                    if !entry.cancel_sent {
                        entry.cancel_sent = true;
                        self.send(writer, Packet::stream_cancel(id)).await?;
                    }
                }
                Ok(None)
            }
            SessionCommand::TerminalInput(data) => {
                self.send(writer, Packet::terminal_input(data)).await?;
                Ok(None)
            }
            SessionCommand::TerminalOutput(data) => {
                self.send(writer, Packet::terminal_output(data)).await?;
                Ok(None)
            }
            SessionCommand::Resize { cols, rows } => {
                self.send(writer, Packet::terminal_resize(cols, rows)).await?;
                Ok(None)
            }
            SessionCommand::Shutdown { reason, message } => {
                self.send(writer, Packet::goodbye(reason, &message)).await?;
                Ok(Some(Farewell {
                    reason,
                    message,
                    from_peer: false,
                }))
            }
        }
    }

    async fn sweep_idle_streams<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: Sink<Packet, Error = FrameError> + Unpin,
    {
        let Some(timeout) = self.config.idle_stream_timeout else {
            return Ok(());
        };
        for id in self.mux.idle_ids(timeout) {
            debug_warn!("closing idle stream {}", id);
            self.fail_stream(writer, id, ErrorCode::Timeout, "idle stream")
                .await?;
        }
        Ok(())
    }
}
