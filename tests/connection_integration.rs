//! Client connection tests against a scripted server over an in-memory pipe
//!
//! These tests verify:
//! - The h2c upgrade handshake and the connection preface
//! - SETTINGS acknowledgement ordering
//! - The first-frame rule
//! - Request writing, PING replies and response tracking
//! - GOAWAY and close handling

mod common;

use bytes::{Bytes, BytesMut};
use h2link::config::{ConnectMode, ConnectionBuilder, ConnectionConfig};
use h2link::http::h2::hpack::fields;
use h2link::http::h2::*;
use h2link::pool::BufferPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const STEP: Duration = Duration::from_secs(2);

const SWITCHING: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";

/// The server half of the pipe, driven step by step by each test
struct FakeServer {
    io: DuplexStream,
    codec: FrameCodec,
    buf: BytesMut,
    hpack: HpackCodec,
}

impl FakeServer {
    fn new(io: DuplexStream) -> Self {
        FakeServer {
            io,
            codec: FrameCodec::new(),
            buf: BytesMut::with_capacity(4096),
            hpack: HpackCodec::new(),
        }
    }

    async fn fill(&mut self) {
        let n = tokio::time::timeout(STEP, self.io.read_buf(&mut self.buf))
            .await
            .expect("client went quiet")
            .unwrap();
        assert!(n > 0, "client closed the pipe");
    }

    /// Read an HTTP/1.1 request head
    async fn read_head(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = self.buf.split_to(pos + 4);
                return String::from_utf8(head.to_vec()).unwrap();
            }
            self.fill().await;
        }
    }

    async fn expect_preface(&mut self) {
        while self.buf.len() < CONNECTION_PREFACE.len() {
            self.fill().await;
        }
        let magic = self.buf.split_to(CONNECTION_PREFACE.len());
        assert_eq!(&magic[..], CONNECTION_PREFACE);
    }

    async fn next_frame(&mut self) -> Frame {
        loop {
            if !self.buf.is_empty() {
                match self.codec.process_next_buffer(&mut self.buf).unwrap() {
                    FrameStatus::Incomplete => {}
                    _ => return self.codec.take_frame().unwrap(),
                }
            }
            self.fill().await;
        }
    }

    /// No bytes arrive within `wait`
    async fn expect_silence(&mut self, wait: Duration) {
        assert!(self.buf.is_empty() && self.codec.buffered() == 0);
        let mut scratch = [0u8; 64];
        let read = tokio::time::timeout(wait, self.io.read(&mut scratch)).await;
        assert!(read.is_err(), "unexpected bytes from client");
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, frame: Frame) {
        let bytes = FrameCodec::encode_frame(&frame);
        self.write(&bytes).await;
    }

    async fn send_headers(&mut self, stream_id: u32, pairs: &[(&str, &str)], end_stream: bool) {
        let block = self.hpack.encode_headers(&fields(pairs)).unwrap();
        self.send(Frame::Headers(HeadersFrame::new(stream_id, block, end_stream, true)))
            .await;
    }

    fn decode(&mut self, block: &[u8]) -> Vec<HeaderField> {
        self.hpack.decode_headers(block).unwrap()
    }
}

fn prior_knowledge() -> ConnectionConfig {
    ConnectionBuilder::new()
        .mode(ConnectMode::PriorKnowledge)
        .build()
        .unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Prior-knowledge connection that has exchanged SETTINGS both ways
async fn established() -> (H2Connection, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = H2Connection::handshake(client, prior_knowledge(), Arc::new(BufferPool::default()))
        .await
        .unwrap();
    let mut server = FakeServer::new(server);
    server.expect_preface().await;
    assert!(matches!(server.next_frame().await, Frame::Settings(s) if !s.ack));

    server.send(Frame::Settings(SettingsFrame::new(Settings::new()))).await;
    assert_eq!(server.next_frame().await, Frame::Settings(SettingsFrame::ack()));
    server.send(Frame::Settings(SettingsFrame::ack())).await;
    conn.wait_established(STEP).await.unwrap();
    (conn, server)
}

#[tokio::test]
async fn test_upgrade_scenario() {
    common::init_tracing();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let config = ConnectionBuilder::new()
        .host("localhost")
        .port(8080)
        .path("/upgrade")
        .build()
        .unwrap();
    let pool = Arc::new(BufferPool::default());

    let server_side = tokio::spawn(async move {
        let mut server = FakeServer::new(server);
        let head = server.read_head().await;
        assert!(head.starts_with("GET /upgrade HTTP/1.1\r\n"), "{}", head);
        assert!(head.contains("Host: localhost:8080\r\n"));
        assert!(head.contains("Upgrade: h2c\r\n"));
        assert!(head.contains("HTTP2-Settings: "));

        // The server's SETTINGS ride in the same write as the 101
        let settings = SettingsBuilder::new().max_concurrent_streams(10).build().unwrap();
        let mut reply = SWITCHING.to_vec();
        reply.extend_from_slice(&FrameCodec::encode_frame(&Frame::Settings(SettingsFrame::new(
            settings,
        ))));
        server.write(&reply).await;

        // Our SETTINGS come first, then exactly one ACK
        server.expect_preface().await;
        assert!(matches!(server.next_frame().await, Frame::Settings(s) if !s.ack));
        assert_eq!(server.next_frame().await, Frame::Settings(SettingsFrame::ack()));
        server
    });

    let conn = H2Connection::handshake(client, config, pool.clone()).await.unwrap();
    let mut server = server_side.await.unwrap();
    conn.wait_established(STEP).await.unwrap();
    assert_eq!(conn.phase(), Phase::Established);
    assert_eq!(
        conn.with_core(|core| core.remote_settings().max_concurrent_streams),
        Some(10)
    );

    conn.add_expected(ExpectedFrame::headers(1, fields(&[(":status", "200")]), false));
    conn.add_expected(ExpectedFrame::data(1, "hello", true));

    // Response to the upgrade request arrives on stream 1
    server.send(Frame::Settings(SettingsFrame::ack())).await;
    server.send_headers(1, &[(":status", "200")], false).await;
    server.send(Frame::Ping(PingFrame::new(*b"12345678"))).await;
    assert_eq!(server.next_frame().await, Frame::Ping(PingFrame::ack(*b"12345678")));
    server
        .send(Frame::Data(DataFrame::new(1, Bytes::from("hello"), true)))
        .await;

    eventually("response frames", || conn.with_tracker(FrameTracker::all_arrived)).await;
    assert!(conn.with_tracker(|t| t.stream_ended(1)));
    assert!(conn.with_core(|core| core.local_settings_acked()));

    server
        .send(Frame::Goaway(GoawayFrame::new(0, ErrorCode::NoError, Bytes::new())))
        .await;
    eventually("GOAWAY", || conn.phase() >= Phase::Closing).await;
    drop(server);

    conn.wait_for_close().await.unwrap();
    assert_eq!(conn.phase(), Phase::Closed);
    assert!(conn.take_errors().is_empty());
    eventually("read buffer returned", || pool.stats().released == 1).await;
}

#[tokio::test]
async fn test_upgrade_rejected() {
    let (client, server) = tokio::io::duplex(4096);
    let server_side = tokio::spawn(async move {
        let mut server = FakeServer::new(server);
        server.read_head().await;
        server
            .write(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await;
        server
    });

    let result =
        H2Connection::handshake(client, ConnectionConfig::default(), Arc::new(BufferPool::default()))
            .await;
    assert!(matches!(
        result,
        Err(Error::Http(h2link::http::Error::Handshake(_)))
    ));
    drop(server_side.await.unwrap());
}

#[tokio::test]
async fn test_upgrade_response_timeout() {
    let (client, _server) = tokio::io::duplex(4096);
    let config = ConnectionBuilder::new()
        .handshake_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let result = H2Connection::handshake(client, config, Arc::new(BufferPool::default())).await;
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_settings_ack_waits_for_own_settings() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut server = FakeServer::new(server);

    // SETTINGS queued before the client has written anything
    server.send(Frame::Settings(SettingsFrame::new(Settings::new()))).await;
    let conn = H2Connection::handshake(client, prior_knowledge(), Arc::new(BufferPool::default()))
        .await
        .unwrap();

    server.expect_preface().await;
    assert!(matches!(server.next_frame().await, Frame::Settings(s) if !s.ack));
    assert_eq!(server.next_frame().await, Frame::Settings(SettingsFrame::ack()));
    server.expect_silence(Duration::from_millis(50)).await;
    conn.wait_established(STEP).await.unwrap();
}

#[tokio::test]
async fn test_first_frame_must_be_settings() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = H2Connection::handshake(client, prior_knowledge(), Arc::new(BufferPool::default()))
        .await
        .unwrap();
    let mut server = FakeServer::new(server);
    server.expect_preface().await;
    server.next_frame().await;

    server.send(Frame::Ping(PingFrame::new([9; 8]))).await;
    eventually("connection marked invalid", || conn.is_invalid()).await;

    server.expect_silence(Duration::from_millis(50)).await;
    assert_eq!(conn.phase(), Phase::AwaitingServerPreface);
    assert!(matches!(
        conn.take_errors().as_slice(),
        [Error::Sequence(SequenceError::UnexpectedFirstFrame(FrameType::Ping))]
    ));
    assert!(matches!(
        conn.wait_established(Duration::from_millis(50)).await,
        Err(Error::Timeout)
    ));
}

#[tokio::test]
async fn test_direct_write_before_established() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = H2Connection::handshake(client, prior_knowledge(), Arc::new(BufferPool::default()))
        .await
        .unwrap();

    let outcome = conn.send_frame(&Frame::Ping(PingFrame::new([1; 8]))).await.unwrap();
    assert_eq!(outcome, SendOutcome::Written(17));

    let mut server = FakeServer::new(server);
    server.expect_preface().await;
    assert!(matches!(server.next_frame().await, Frame::Settings(_)));
    assert_eq!(server.next_frame().await, Frame::Ping(PingFrame::new([1; 8])));
}

#[tokio::test]
async fn test_rejected_direct_write_keeps_queued_frames() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = H2Connection::handshake(client, prior_knowledge(), Arc::new(BufferPool::default()))
        .await
        .unwrap();

    conn.with_core(|core| core.queue_frame(&Frame::Ping(PingFrame::new([1; 8]))))
        .unwrap();
    let rejected = conn
        .send_frame(&Frame::Data(DataFrame::new(7, Bytes::from("x"), false)))
        .await;
    assert!(matches!(rejected, Err(Error::StreamClosed(7))));

    // The earlier PING goes out ahead of the next direct write
    let outcome = conn.send_frame(&Frame::Ping(PingFrame::new([2; 8]))).await.unwrap();
    assert_eq!(outcome, SendOutcome::Written(34));

    let mut server = FakeServer::new(server);
    server.expect_preface().await;
    assert!(matches!(server.next_frame().await, Frame::Settings(_)));
    assert_eq!(server.next_frame().await, Frame::Ping(PingFrame::new([1; 8])));
    assert_eq!(server.next_frame().await, Frame::Ping(PingFrame::new([2; 8])));
}

#[tokio::test]
async fn test_requests_written_in_order() {
    common::init_tracing();
    let (conn, mut server) = established().await;

    let get = conn
        .request(fields(&[(":method", "GET"), (":path", "/a")]), None)
        .await
        .unwrap();
    let outcome = conn.send_frame(&Frame::Ping(PingFrame::new([2; 8]))).await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    let post = conn
        .request(
            fields(&[(":method", "POST"), (":path", "/b")]),
            Some(Bytes::from("payload")),
        )
        .await
        .unwrap();
    assert_eq!((get, post), (1, 3));

    match server.next_frame().await {
        Frame::Headers(h) => {
            assert_eq!(h.stream_id, get);
            assert!(h.end_stream && h.end_headers);
            let decoded = server.decode(&h.header_block);
            assert_eq!(decoded, fields(&[(":method", "GET"), (":path", "/a")]));
        }
        other => panic!("expected HEADERS, got {}", other),
    }
    assert_eq!(server.next_frame().await, Frame::Ping(PingFrame::new([2; 8])));
    match server.next_frame().await {
        Frame::Headers(h) => {
            assert_eq!(h.stream_id, post);
            assert!(!h.end_stream);
            let decoded = server.decode(&h.header_block);
            assert_eq!(decoded, fields(&[(":method", "POST"), (":path", "/b")]));
        }
        other => panic!("expected HEADERS, got {}", other),
    }
    assert_eq!(
        server.next_frame().await,
        Frame::Data(DataFrame::new(post, Bytes::from("payload"), true))
    );
    assert!(conn.with_core(|core| core.pending_writes().is_empty()));
}

#[tokio::test]
async fn test_sentinel_hook_over_connection() {
    let (conn, mut server) = established().await;
    conn.set_hook(Some(Box::new(SentinelHook::new())));

    let stream_id = conn.request(fields(&[(":method", "GET")]), None).await.unwrap();
    server.next_frame().await;
    server.send_headers(stream_id, &[(":status", "200")], false).await;
    server
        .send(Frame::Data(DataFrame::new(
            stream_id,
            Bytes::from_static(hooks::SEND_WINDOW_UPDATE),
            false,
        )))
        .await;
    assert_eq!(
        server.next_frame().await,
        Frame::WindowUpdate(WindowUpdateFrame::new(0, 1))
    );
}

#[tokio::test]
async fn test_unexpected_goaway_recorded() {
    let (conn, mut server) = established().await;
    server
        .send(Frame::Goaway(GoawayFrame::new(
            0,
            ErrorCode::ProtocolError,
            Bytes::from("bad"),
        )))
        .await;
    eventually("GOAWAY processed", || conn.is_invalid()).await;
    assert_eq!(conn.phase(), Phase::Closing);
    assert!(matches!(
        conn.take_errors().as_slice(),
        [Error::Sequence(SequenceError::UnexpectedGoaway {
            error_code: ErrorCode::ProtocolError,
            ..
        })]
    ));

    drop(server);
    conn.wait_for_phase(Phase::Closed, STEP).await.unwrap();
}

#[tokio::test]
async fn test_wait_for_close_reports_open_connection() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let config = ConnectionBuilder::new()
        .mode(ConnectMode::PriorKnowledge)
        .close_checks(vec![Duration::from_millis(30), Duration::from_millis(30)])
        .build()
        .unwrap();
    let conn = H2Connection::handshake(client, config, Arc::new(BufferPool::default()))
        .await
        .unwrap();
    let mut server = FakeServer::new(server);
    server.expect_preface().await;
    server.next_frame().await;
    server.send(Frame::Settings(SettingsFrame::new(Settings::new()))).await;
    server
        .send(Frame::Goaway(GoawayFrame::new(0, ErrorCode::NoError, Bytes::new())))
        .await;
    eventually("GOAWAY", || conn.phase() == Phase::Closing).await;

    let result = conn.wait_for_close().await;
    assert!(matches!(result, Err(Error::NotClosed(waited)) if waited == Duration::from_millis(60)));
    assert!(matches!(conn.take_errors().as_slice(), [Error::NotClosed(_)]));
    drop(server);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (conn, mut server) = established().await;
    conn.close().await;
    conn.close().await;
    assert_eq!(conn.phase(), Phase::Closed);
    assert!(matches!(
        conn.send_frame(&Frame::Ping(PingFrame::new([0; 8]))).await,
        Err(Error::ConnectionClosed)
    ));

    // The writer was shut down, so the server sees end of stream
    let mut rest = Vec::new();
    let n = tokio::time::timeout(STEP, server.io.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}
