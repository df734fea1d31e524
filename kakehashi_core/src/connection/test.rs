//! End-to-end session tests: a real node endpoint against either a real
//! relay endpoint or a scripted packet-level peer, over in-memory duplex
//! pipes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use kakehashi_wire::{
    EndStatus, ErrorCode, GoodbyeReason, Hello, HelloAck, OpenRequest, PROTOCOL_VERSION, Packet,
    PacketType, RELAY_MAX_PACKET, SessionFlags, WireCodec, meta,
};

use crate::connection::error::{ConnectionError, Result};
use crate::connection::session::{Farewell, Session, SessionConfig, SessionControl};
use crate::ops::{NodeDispatcher, RejectDispatcher, path_to_bytes};
use crate::relay::{self, ExecEvent, HostTerminal, IdentityFilter, RelayHandle, TerminalFilter};
use crate::terminal::TerminalEvent;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kakehashi-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn spawn_node(
    scratch: &Path,
    io: DuplexStream,
    tune: impl FnOnce(SessionConfig) -> SessionConfig,
) -> (
    JoinHandle<Result<Farewell>>,
    SessionControl,
    mpsc::UnboundedReceiver<TerminalEvent>,
) {
    let config = tune(SessionConfig::node(path_to_bytes(scratch)));
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (session, control) = Session::new(
        config,
        Arc::new(NodeDispatcher::new(scratch.to_path_buf())),
        sink_tx,
    );
    (tokio::spawn(session.run(io)), control, sink_rx)
}

// ============================================================================
// Real node against a real relay
// ============================================================================

mod endpoint_pair {
    use super::*;

    /// Host terminal backed by channels the test drives directly.
    struct TestTerminal {
        output: mpsc::UnboundedReceiver<Bytes>,
        input: mpsc::UnboundedSender<Bytes>,
        resizes: mpsc::UnboundedSender<(u16, u16)>,
    }

    #[async_trait]
    impl HostTerminal for TestTerminal {
        async fn read_output(&mut self) -> std::io::Result<Bytes> {
            match self.output.recv().await {
                Some(data) => Ok(data),
                // Sender dropped at test teardown; never report EOF.
                None => std::future::pending().await,
            }
        }

        async fn write_input(&mut self, data: &[u8]) -> std::io::Result<()> {
            let _ = self.input.send(Bytes::copy_from_slice(data));
            Ok(())
        }

        async fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
            let _ = self.resizes.send((cols, rows));
            Ok(())
        }
    }

    struct Bridge {
        relay: RelayHandle,
        #[allow(dead_code)]
        relay_task: JoinHandle<Result<Farewell>>,
        node_task: JoinHandle<Result<Farewell>>,
        node_control: SessionControl,
        node_events: mpsc::UnboundedReceiver<TerminalEvent>,
        host_output: mpsc::UnboundedSender<Bytes>,
        host_input: mpsc::UnboundedReceiver<Bytes>,
        host_resizes: mpsc::UnboundedReceiver<(u16, u16)>,
    }

    async fn bridge(scratch: &Path) -> Bridge {
        bridge_with(scratch, |c| c, |c| c, Box::new(IdentityFilter)).await
    }

    async fn bridge_with(
        scratch: &Path,
        tune_node: impl FnOnce(SessionConfig) -> SessionConfig,
        tune_relay: impl FnOnce(SessionConfig) -> SessionConfig,
        filter: Box<dyn TerminalFilter>,
    ) -> Bridge {
        let (node_io, relay_io) = tokio::io::duplex(1 << 20);
        let (node_task, node_control, node_events) = spawn_node(scratch, node_io, tune_node);

        let (host_output, output_rx) = mpsc::unbounded_channel();
        let (input_tx, host_input) = mpsc::unbounded_channel();
        let (resize_tx, host_resizes) = mpsc::unbounded_channel();
        let terminal = TestTerminal {
            output: output_rx,
            input: input_tx,
            resizes: resize_tx,
        };
        let (relay, relay_task) = relay::start(
            relay_io,
            tune_relay(SessionConfig::relay()),
            Box::new(terminal),
            filter,
        );
        relay.control().established().await.unwrap();

        Bridge {
            relay,
            relay_task,
            node_task,
            node_control,
            node_events,
            host_output,
            host_input,
            host_resizes,
        }
    }

    async fn recv_output(events: &mut mpsc::UnboundedReceiver<TerminalEvent>) -> Bytes {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for terminal output")
                .expect("terminal sink closed")
            {
                TerminalEvent::Output(data) => return data,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn handshake_and_terminal_echo() {
        let scratch = scratch_dir("echo");
        let mut bridge = bridge(&scratch).await;

        // Both sides report the negotiated peer.
        let peer_of_relay = bridge.relay.control().established().await.unwrap();
        assert_eq!(peer_of_relay.version, PROTOCOL_VERSION);
        assert_eq!(peer_of_relay.cwd.as_deref(), Some(&path_to_bytes(&scratch)[..]));
        let peer_of_node = bridge.node_control.established().await.unwrap();
        assert_eq!(peer_of_node.version, PROTOCOL_VERSION);
        assert!(peer_of_node.cwd.is_none());

        // Keystrokes land on the host terminal.
        let terminal = bridge.node_control.terminal();
        terminal.send_input(Bytes::from_static(b"ls\n")).await.unwrap();
        let input = tokio::time::timeout(Duration::from_secs(5), bridge.host_input.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&input[..], b"ls\n");

        // Screen bytes land on the node's sink.
        bridge
            .host_output
            .send(Bytes::from_static(b"file-a  file-b\r\n"))
            .unwrap();
        let output = recv_output(&mut bridge.node_events).await;
        assert_eq!(&output[..], b"file-a  file-b\r\n");

        // Geometry reaches the host surface.
        terminal.resize(120, 40).unwrap();
        let resize = tokio::time::timeout(Duration::from_secs(5), bridge.host_resizes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resize, (120, 40));

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn simple_mode_filters_output_on_relay() {
        let scratch = scratch_dir("simple");

        struct Upper;
        impl TerminalFilter for Upper {
            fn filter(&mut self, input: &[u8], out: &mut Vec<u8>) {
                out.extend(input.iter().map(|b| b.to_ascii_uppercase()));
            }
        }

        let mut bridge = bridge_with(
            &scratch,
            |c| c.flags(SessionFlags::new().with_simple()),
            |c| c,
            Box::new(Upper),
        )
        .await;

        let peer = bridge.relay.control().established().await.unwrap();
        assert!(peer.flags.simple());

        bridge.host_output.send(Bytes::from_static(b"hello")).unwrap();
        let output = recv_output(&mut bridge.node_events).await;
        assert_eq!(&output[..], b"HELLO");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn file_read_streams_contents() {
        let scratch = scratch_dir("read");
        let contents: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(scratch.join("big.dat"), &contents).unwrap();

        let bridge = bridge(&scratch).await;
        let fetched = bridge
            .relay
            .read_file(&path_to_bytes(&scratch.join("big.dat")))
            .await
            .unwrap();
        assert_eq!(fetched, contents);

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn file_read_relative_path_uses_announced_cwd() {
        let scratch = scratch_dir("relcwd");
        std::fs::write(scratch.join("note.txt"), b"relative\n").unwrap();

        let bridge = bridge(&scratch).await;
        let fetched = bridge.relay.read_file(b"note.txt").await.unwrap();
        assert_eq!(fetched, b"relative\n");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn file_read_missing_is_not_found() {
        let scratch = scratch_dir("missing");
        let bridge = bridge(&scratch).await;
        let err = bridge.relay.read_file(b"no-such-file").await.unwrap_err();
        match err {
            crate::connection::stream::OpError::Failed { code, .. } => {
                assert_eq!(code, ErrorCode::NotFound);
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let scratch = scratch_dir("write");
        let bridge = bridge(&scratch).await;
        let path = path_to_bytes(&scratch.join("x"));

        bridge.relay.write_file(&path, b"hello\n", 0o644).await.unwrap();
        assert_eq!(bridge.relay.read_file(&path).await.unwrap(), b"hello\n");
        assert_eq!(std::fs::read(scratch.join("x")).unwrap(), b"hello\n");

        // Truncate semantics: a second, shorter write wins outright.
        bridge.relay.write_file(&path, b"hi", 0).await.unwrap();
        assert_eq!(std::fs::read(scratch.join("x")).unwrap(), b"hi");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn concurrent_reads_share_the_window() {
        let scratch = scratch_dir("concurrent");
        let a: Vec<u8> = (0..1_000_000u32).map(|i| (i % 239) as u8).collect();
        let b: Vec<u8> = (0..1_000_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(scratch.join("a.dat"), &a).unwrap();
        std::fs::write(scratch.join("b.dat"), &b).unwrap();

        // A 64 KiB window forces interleaved WindowUpdate-driven
        // progress on both streams at once.
        let bridge = bridge_with(&scratch, |c| c, |c| c.recv_window(64 * 1024), Box::new(IdentityFilter)).await;

        let path_a = path_to_bytes(&scratch.join("a.dat"));
        let path_b = path_to_bytes(&scratch.join("b.dat"));
        let (got_a, got_b) = tokio::join!(
            bridge.relay.read_file(&path_a),
            bridge.relay.read_file(&path_b),
        );
        assert_eq!(got_a.unwrap(), a);
        assert_eq!(got_b.unwrap(), b);

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn stat_lstat_and_exists() {
        let scratch = scratch_dir("stat");
        std::fs::write(scratch.join("plain"), b"12345").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(scratch.join("plain"), scratch.join("link")).unwrap();

        let bridge = bridge(&scratch).await;

        let plain = bridge.relay.stat(&path_to_bytes(&scratch.join("plain"))).await.unwrap();
        assert!(plain.exists);
        assert_eq!(plain.kind, kakehashi_wire::EntryKind::File);
        assert_eq!(plain.size, 5);
        assert!(plain.mtime > 0);

        #[cfg(unix)]
        {
            let followed = bridge.relay.stat(&path_to_bytes(&scratch.join("link"))).await.unwrap();
            assert_eq!(followed.kind, kakehashi_wire::EntryKind::File);
            assert_eq!(followed.size, 5);

            let unfollowed = bridge.relay.lstat(&path_to_bytes(&scratch.join("link"))).await.unwrap();
            assert_eq!(unfollowed.kind, kakehashi_wire::EntryKind::Symlink);
        }

        // A missing path is a normal exists=false reply, not an error.
        let absent = bridge.relay.stat(b"absent").await.unwrap();
        assert!(!absent.exists);
        assert_eq!(absent.size, 0);

        assert!(bridge.relay.exists(&path_to_bytes(&scratch.join("plain"))).await.unwrap());
        assert!(!bridge.relay.exists(b"absent").await.unwrap());

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn make_dir_is_idempotent() {
        let scratch = scratch_dir("mkdir");
        let bridge = bridge(&scratch).await;
        let path = path_to_bytes(&scratch.join("d"));

        bridge.relay.make_dir(&path).await.unwrap();
        bridge.relay.make_dir(&path).await.unwrap();
        assert!(scratch.join("d").is_dir());

        // A file squatting on the path is a real failure.
        std::fs::write(scratch.join("f"), b"").unwrap();
        let err = bridge.relay.make_dir(&path_to_bytes(&scratch.join("f"))).await.unwrap_err();
        match err {
            crate::connection::stream::OpError::Failed { code, .. } => {
                assert_eq!(code, ErrorCode::Exists);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn remove_is_unlink_only() {
        let scratch = scratch_dir("remove");
        std::fs::write(scratch.join("f"), b"x").unwrap();
        std::fs::create_dir(scratch.join("d")).unwrap();

        let bridge = bridge(&scratch).await;
        bridge.relay.remove(&path_to_bytes(&scratch.join("f"))).await.unwrap();
        assert!(!scratch.join("f").exists());

        let err = bridge.relay.remove(&path_to_bytes(&scratch.join("d"))).await.unwrap_err();
        match err {
            crate::connection::stream::OpError::Failed { code, .. } => {
                assert_eq!(code, ErrorCode::IsDir);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let err = bridge.relay.remove(b"gone").await.unwrap_err();
        match err {
            crate::connection::stream::OpError::Failed { code, .. } => {
                assert_eq!(code, ErrorCode::NotFound);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn move_preserves_size_and_mtime() {
        let scratch = scratch_dir("move");
        std::fs::write(scratch.join("old"), b"move me around").unwrap();

        let bridge = bridge(&scratch).await;
        let before = bridge.relay.stat(&path_to_bytes(&scratch.join("old"))).await.unwrap();
        bridge
            .relay
            .rename(&path_to_bytes(&scratch.join("old")), &path_to_bytes(&scratch.join("new")))
            .await
            .unwrap();
        let after = bridge.relay.stat(&path_to_bytes(&scratch.join("new"))).await.unwrap();

        assert_eq!(after.size, before.size);
        assert_eq!(after.mtime, before.mtime);
        assert!(!bridge.relay.exists(&path_to_bytes(&scratch.join("old"))).await.unwrap());

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn resolve_path_canonicalizes() {
        let scratch = scratch_dir("resolve");
        std::fs::create_dir(scratch.join("sub")).unwrap();
        std::fs::write(scratch.join("target.txt"), b"x").unwrap();

        let bridge = bridge(&scratch).await;
        let twisted = scratch.join("sub").join("..").join("target.txt");
        let resolved = bridge.relay.resolve_path(&path_to_bytes(&twisted)).await.unwrap();
        let expected = std::fs::canonicalize(&twisted).unwrap();
        assert_eq!(resolved, path_to_bytes(&expected));

        let err = bridge.relay.resolve_path(b"nowhere").await.unwrap_err();
        match err {
            crate::connection::stream::OpError::Failed { code, .. } => {
                assert_eq!(code, ErrorCode::NotFound);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn list_dir_reports_entries() {
        let scratch = scratch_dir("listdir");
        std::fs::write(scratch.join("a.txt"), b"aaaa").unwrap();
        std::fs::create_dir(scratch.join("subdir")).unwrap();
        std::fs::write(scratch.join(".hidden"), b"h").unwrap();

        let bridge = bridge(&scratch).await;
        let mut entries = bridge.relay.list_dir(&path_to_bytes(&scratch)).await.unwrap();
        entries.sort_by(|x, y| x.name.cmp(&y.name));

        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(
            names,
            vec![b".hidden".as_slice(), b"a.txt".as_slice(), b"subdir".as_slice()]
        );
        assert_eq!(entries[1].kind, kakehashi_wire::EntryKind::File);
        assert_eq!(entries[1].size, 4);
        assert_eq!(entries[2].kind, kakehashi_wire::EntryKind::Dir);

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn glob_find_matches_leaf_names() {
        let scratch = scratch_dir("glob");
        let src = scratch.join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.c"), b"").unwrap();
        std::fs::write(src.join("b.c"), b"").unwrap();
        std::fs::write(src.join("c.h"), b"").unwrap();
        std::fs::write(src.join("sub").join("d.c"), b"").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&src, src.join("sub").join("loop")).unwrap();

        let bridge = bridge(&scratch).await;
        let mut found = bridge
            .relay
            .glob_find(&path_to_bytes(&src), b"*.c")
            .await
            .unwrap();
        found.sort();

        let mut expected = vec![
            path_to_bytes(&src.join("a.c")),
            path_to_bytes(&src.join("b.c")),
            path_to_bytes(&src.join("sub").join("d.c")),
        ];
        expected.sort();
        assert_eq!(found, expected);

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn search_finds_lines_and_honors_skips() {
        let scratch = scratch_dir("search");
        let src = scratch.join("proj");
        std::fs::create_dir_all(src.join(".git")).unwrap();
        std::fs::write(src.join("lib.rs"), b"fn a() {}\n// TODO: fix\nfn b() {}\n// TODO: more\n")
            .unwrap();
        std::fs::write(src.join("main.rs"), b"// TODO: start\n").unwrap();
        std::fs::write(src.join("notes.txt"), b"TODO but wrong extension\n").unwrap();
        std::fs::write(src.join(".git").join("config"), b"TODO hidden\n").unwrap();
        std::fs::write(src.join("blob.dat"), b"TODO\x00binary\n").unwrap();

        let bridge = bridge(&scratch).await;
        let mut hits = bridge
            .relay
            .search(&path_to_bytes(&src), b"TODO", Some(b"*.rs"))
            .await
            .unwrap();
        hits.sort_by(|x, y| x.path.cmp(&y.path).then(x.line.cmp(&y.line)));

        let summary: Vec<(Vec<u8>, u32, Vec<u8>)> = hits
            .into_iter()
            .map(|h| (h.path, h.line, h.text))
            .collect();
        assert_eq!(
            summary,
            vec![
                (path_to_bytes(&src.join("lib.rs")), 2, b"// TODO: fix".to_vec()),
                (path_to_bytes(&src.join("lib.rs")), 4, b"// TODO: more".to_vec()),
                (path_to_bytes(&src.join("main.rs")), 1, b"// TODO: start".to_vec()),
            ]
        );

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn search_stops_at_result_cap() {
        let scratch = scratch_dir("searchcap");
        let mut body = String::new();
        for i in 0..250 {
            body.push_str(&format!("line {} MARKER\n", i));
        }
        std::fs::write(scratch.join("big.txt"), body).unwrap();

        let bridge = bridge(&scratch).await;
        let hits = bridge
            .relay
            .search(&path_to_bytes(&scratch), b"MARKER", None)
            .await
            .unwrap();
        assert_eq!(hits.len(), crate::ops::search::SEARCH_MAX_MATCHES);

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_merges_output_and_reports_exit() {
        let scratch = scratch_dir("exec");
        let bridge = bridge(&scratch).await;

        let outcome = bridge
            .relay
            .execute_collect(b"echo out; echo err 1>&2; exit 3")
            .await
            .unwrap();
        assert_eq!(outcome.status, EndStatus::NormalExit);
        assert_eq!(outcome.detail, Some(3));

        let stdout: Vec<u8> = outcome
            .chunks
            .iter()
            .filter(|(ch, _)| *ch == kakehashi_wire::ExecChannel::Stdout)
            .flat_map(|(_, b)| b.iter().copied())
            .collect();
        let stderr: Vec<u8> = outcome
            .chunks
            .iter()
            .filter(|(ch, _)| *ch == kakehashi_wire::ExecChannel::Stderr)
            .flat_map(|(_, b)| b.iter().copied())
            .collect();
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_cancel_kills_the_child() {
        let scratch = scratch_dir("cancel");
        let bridge = bridge(&scratch).await;

        let mut exec = bridge.relay.execute(b"sleep 30; echo done").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        exec.cancel();

        let mut saw_done = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), exec.next())
                .await
                .expect("cancel did not resolve in time")
                .unwrap()
            {
                ExecEvent::Chunk(_, data) => {
                    if data.windows(4).any(|w| w == b"done") {
                        saw_done = true;
                    }
                }
                ExecEvent::Exited { status, .. } => {
                    assert_eq!(status, EndStatus::Cancelled);
                    break;
                }
            }
        }
        assert!(!saw_done, "cancelled command still produced its output");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn terminal_survives_stream_failures() {
        let scratch = scratch_dir("survive");
        let mut bridge = bridge(&scratch).await;

        for _ in 0..3 {
            let _ = bridge.relay.read_file(b"does-not-exist").await.unwrap_err();
        }

        // The terminal channel is unharmed by the failed streams.
        bridge.host_output.send(Bytes::from_static(b"still here")).unwrap();
        let output = recv_output(&mut bridge.node_events).await;
        assert_eq!(&output[..], b"still here");

        // And so is the next operation.
        std::fs::write(scratch.join("ok.txt"), b"fine").unwrap();
        assert_eq!(
            bridge.relay.read_file(&path_to_bytes(&scratch.join("ok.txt"))).await.unwrap(),
            b"fine"
        );

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn shutdown_sends_goodbye_both_ways() {
        let scratch = scratch_dir("goodbye");
        let bridge = bridge(&scratch).await;

        bridge
            .relay
            .control()
            .shutdown(GoodbyeReason::Shutdown, "test over");
        let node_farewell = bridge.node_task.await.unwrap().unwrap();
        assert_eq!(node_farewell.reason, GoodbyeReason::Shutdown);
        assert!(node_farewell.from_peer);
        assert_eq!(node_farewell.message, "test over");

        let _ = std::fs::remove_dir_all(&scratch);
    }
}

// ============================================================================
// Scripted packet-level peers
// ============================================================================

mod scripted_peer {
    use super::*;

    type PeerReader = FramedRead<ReadHalf<DuplexStream>, WireCodec>;
    type PeerWriter = FramedWrite<WriteHalf<DuplexStream>, WireCodec>;

    fn peer_framing(io: DuplexStream) -> (PeerReader, PeerWriter) {
        let (read, write) = tokio::io::split(io);
        (
            FramedRead::new(read, WireCodec::new(RELAY_MAX_PACKET)),
            FramedWrite::new(write, WireCodec::new(RELAY_MAX_PACKET)),
        )
    }

    async fn next_packet(reader: &mut PeerReader) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed")
            .expect("framing error")
    }

    /// Skip WindowUpdates, which arrive whenever credit thresholds say so.
    async fn next_non_window(reader: &mut PeerReader) -> Packet {
        loop {
            let packet = next_packet(reader).await;
            if packet.kind != PacketType::WindowUpdate {
                return packet;
            }
        }
    }

    /// Drive a node through its handshake and return the framed peer.
    async fn handshaked_node(
        scratch: &Path,
        tune: impl FnOnce(SessionConfig) -> SessionConfig,
    ) -> (JoinHandle<Result<Farewell>>, PeerReader, PeerWriter) {
        let (node_io, peer_io) = tokio::io::duplex(1 << 20);
        let (task, _control, _events) = spawn_node(scratch, node_io, tune);
        let (mut reader, mut writer) = peer_framing(peer_io);

        let hello_packet = next_packet(&mut reader).await;
        assert_eq!(hello_packet.kind, PacketType::Hello);
        let hello = Hello::decode(&hello_packet.payload).unwrap();
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert_eq!(hello.cwd, path_to_bytes(scratch));

        let ack = HelloAck {
            version: PROTOCOL_VERSION,
            flags: SessionFlags::new(),
            window: 262_144,
        };
        writer
            .send(Packet::new(PacketType::HelloAck, ack.encode()))
            .await
            .unwrap();

        (task, reader, writer)
    }

    #[tokio::test]
    async fn file_read_over_the_wire() {
        let scratch = scratch_dir("wire-read");
        std::fs::write(scratch.join("motd"), b"welcome to the machine\n").unwrap();
        let (_task, mut reader, mut writer) = handshaked_node(&scratch, |c| c).await;

        let request = OpenRequest::FileRead {
            path: path_to_bytes(&scratch.join("motd")),
        };
        writer.send(request.open_packet(2)).await.unwrap();

        let mut contents = Vec::new();
        loop {
            let packet = next_non_window(&mut reader).await;
            match packet.kind {
                PacketType::StreamData => {
                    let (id, body) = meta::split_stream_id(&packet.payload).unwrap();
                    assert_eq!(id, 2);
                    contents.extend_from_slice(&body);
                }
                PacketType::StreamEnd => {
                    let (id, status, _) = meta::parse_end(&packet.payload).unwrap();
                    assert_eq!(id, 2);
                    assert_eq!(status, EndStatus::Ok);
                    break;
                }
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert_eq!(contents, b"welcome to the machine\n");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn zero_byte_data_is_preserved() {
        let scratch = scratch_dir("wire-zero");
        let (_task, mut reader, mut writer) = handshaked_node(&scratch, |c| c).await;

        let request = OpenRequest::FileWrite {
            path: path_to_bytes(&scratch.join("empty")),
            mode: 0,
        };
        writer.send(request.open_packet(2)).await.unwrap();
        writer.send(Packet::stream_data(2, b"")).await.unwrap();
        writer
            .send(Packet::stream_end(2, EndStatus::Ok, b""))
            .await
            .unwrap();

        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::StreamEnd);
        let (id, status, _) = meta::parse_end(&packet.payload).unwrap();
        assert_eq!((id, status), (2, EndStatus::Ok));
        assert_eq!(std::fs::read(scratch.join("empty")).unwrap(), b"");

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicate_open_rejects_offender_only() {
        let scratch = scratch_dir("wire-dup");
        let (_task, mut reader, mut writer) = handshaked_node(&scratch, |c| c).await;

        let long_running = OpenRequest::Execute {
            command: b"sleep 5".to_vec(),
        };
        writer.send(long_running.open_packet(2)).await.unwrap();

        // Same id again while stream 2 is live.
        let offender = OpenRequest::FileRead {
            path: b"/etc/hostname".to_vec(),
        };
        writer.send(offender.open_packet(2)).await.unwrap();

        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::StreamError);
        let (id, code, _) = meta::parse_error(&packet.payload).unwrap();
        assert_eq!((id, code), (2, ErrorCode::Invalid));

        // The original stream still answers its cancel, proving it
        // survived the duplicate.
        writer.send(Packet::stream_cancel(2)).await.unwrap();
        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::StreamEnd);
        let (id, status, _) = meta::parse_end(&packet.payload).unwrap();
        assert_eq!((id, status), (2, EndStatus::Cancelled));

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn wrong_parity_open_is_invalid() {
        let scratch = scratch_dir("wire-parity");
        let (_task, mut reader, mut writer) = handshaked_node(&scratch, |c| c).await;

        let request = OpenRequest::Exists { path: b"/".to_vec() };
        writer.send(request.open_packet(3)).await.unwrap();

        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::StreamError);
        let (id, code, _) = meta::parse_error(&packet.payload).unwrap();
        assert_eq!((id, code), (3, ErrorCode::Invalid));

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let scratch = scratch_dir("wire-ping");
        let (_task, mut reader, mut writer) = handshaked_node(&scratch, |c| c).await;

        writer.send(Packet::ping(99)).await.unwrap();
        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::Pong);
        assert_eq!(
            kakehashi_wire::bootstrap::decode_nonce(&packet.payload).unwrap(),
            99
        );

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn unsolicited_credit_is_fatal() {
        let scratch = scratch_dir("wire-credit");
        let (task, mut reader, mut writer) = handshaked_node(&scratch, |c| c).await;

        writer.send(Packet::window_update(512)).await.unwrap();

        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::Goodbye);
        let bye = kakehashi_wire::Goodbye::decode(&packet.payload).unwrap();
        assert_eq!(bye.reason, GoodbyeReason::ProtocolError);

        match task.await.unwrap() {
            Err(ConnectionError::CreditOverflow) => {}
            other => panic!("expected credit overflow, got {:?}", other),
        }

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[tokio::test]
    async fn relay_rejects_non_hello_first_packet() {
        let (relay_io, peer_io) = tokio::io::duplex(1 << 20);
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let (session, _control) =
            Session::new(SessionConfig::relay(), Arc::new(RejectDispatcher), sink_tx);
        let task = tokio::spawn(session.run(relay_io));

        let (mut reader, mut writer) = peer_framing(peer_io);
        writer.send(Packet::ping(1)).await.unwrap();

        let packet = next_packet(&mut reader).await;
        assert_eq!(packet.kind, PacketType::Goodbye);
        let bye = kakehashi_wire::Goodbye::decode(&packet.payload).unwrap();
        assert_eq!(bye.reason, GoodbyeReason::ProtocolError);

        match task.await.unwrap() {
            Err(ConnectionError::FirstPacketNotHello(code)) => {
                assert_eq!(code, PacketType::Ping.code());
            }
            other => panic!("expected first-packet error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn relay_rejects_version_mismatch() {
        let (relay_io, peer_io) = tokio::io::duplex(1 << 20);
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let (session, _control) =
            Session::new(SessionConfig::relay(), Arc::new(RejectDispatcher), sink_tx);
        let task = tokio::spawn(session.run(relay_io));

        let (mut reader, mut writer) = peer_framing(peer_io);
        let hello = Hello {
            version: 9,
            flags: SessionFlags::new(),
            window: 262_144,
            cwd: b"/".to_vec(),
        };
        writer
            .send(Packet::new(PacketType::Hello, hello.encode()))
            .await
            .unwrap();

        let packet = next_packet(&mut reader).await;
        assert_eq!(packet.kind, PacketType::Goodbye);
        let bye = kakehashi_wire::Goodbye::decode(&packet.payload).unwrap();
        assert_eq!(bye.reason, GoodbyeReason::VersionMismatch);

        match task.await.unwrap() {
            Err(ConnectionError::UnsupportedProtocolVersion(9)) => {}
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn relay_answers_hello_with_ack() {
        let (relay_io, peer_io) = tokio::io::duplex(1 << 20);
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let (session, control) = Session::new(
            SessionConfig::relay().recv_window(131_072),
            Arc::new(RejectDispatcher),
            sink_tx,
        );
        let _task = tokio::spawn(session.run(relay_io));

        let (mut reader, mut writer) = peer_framing(peer_io);
        let hello = Hello {
            version: PROTOCOL_VERSION,
            flags: SessionFlags::new().with_resume(),
            window: 65_536,
            cwd: b"/home/user".to_vec(),
        };
        writer
            .send(Packet::new(PacketType::Hello, hello.encode()))
            .await
            .unwrap();

        let packet = next_packet(&mut reader).await;
        assert_eq!(packet.kind, PacketType::HelloAck);
        let ack = HelloAck::decode(&packet.payload).unwrap();
        assert_eq!(ack.version, PROTOCOL_VERSION);
        assert_eq!(ack.window, 131_072);

        let peer = control.established().await.unwrap();
        assert_eq!(peer.cwd.as_deref(), Some(b"/home/user".as_slice()));
        assert!(peer.flags.resume());
        assert_eq!(peer.window, 65_536);
    }

    #[tokio::test]
    async fn keepalive_gives_up_on_silent_peer() {
        let scratch = scratch_dir("wire-keepalive");
        let (task, mut reader, _writer) = handshaked_node(&scratch, |mut c| {
            c.keepalive_interval = Duration::from_millis(100);
            c.keepalive_deadline = Duration::from_millis(100);
            c
        })
        .await;

        // The node pings; we never answer.
        let packet = next_non_window(&mut reader).await;
        assert_eq!(packet.kind, PacketType::Ping);

        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(Err(ConnectionError::KeepaliveTimeout))) => {}
            other => panic!("expected keepalive timeout, got {:?}", other),
        }

        let _ = std::fs::remove_dir_all(&scratch);
    }
}
