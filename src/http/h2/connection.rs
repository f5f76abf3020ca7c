//! HTTP/2 client connection
//!
//! [`ConnectionCore`] holds all protocol state and never touches a socket:
//! bytes go in through [`ConnectionCore::process_read`], frames to send come
//! out of its pending-write queue. [`H2Connection`] drives a core over a real
//! transport with one read task and a single writer.
//!
//! Phases move strictly forward:
//! `PreUpgrade -> AwaitingServerPreface -> Established -> Closing -> Closed`.
//! Errors found while processing inbound bytes have no caller to return to,
//! so they are collected on the connection and drained with `take_errors`.

use super::codec::{FrameCodec, FrameStatus};
use super::error::{Error, ErrorCode, Result, SequenceError};
use super::flow_control::ConnectionFlowControl;
use super::frames::*;
use super::hooks::FrameHook;
use super::hpack::{HeaderCodec, HeaderField, HpackCodec};
use super::settings::Settings;
use super::stream::{H2Stream, StreamManager};
use super::tracker::{ExpectedFrame, FrameTracker, ObservedFrame};
use super::write_queue::WriteQueue;
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::config::{ConnectMode, ConnectionConfig};
use crate::http::upgrade::{UpgradeRequest, UpgradeResponse, UpgradeResponseParser};
use crate::pool::BufferPool;
use crate::transport::{self, Transport, TransportReader, TransportWriter};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Exchanging the HTTP/1.1 upgrade
    PreUpgrade,
    /// Upgrade done (or skipped); waiting for the server's SETTINGS
    AwaitingServerPreface,
    Established,
    /// GOAWAY sent or received
    Closing,
    Closed,
}

/// Result of [`H2Connection::send_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written directly to the transport before the connection was established
    Written(usize),
    /// Queued and flushed through the connection's writer
    Queued,
}

#[derive(Debug)]
enum BlockKind {
    Headers { end_stream: bool },
    PushPromise,
}

/// Header block waiting for CONTINUATION frames
#[derive(Debug)]
struct OpenBlock {
    stream_id: u32,
    kind: BlockKind,
    fragments: BytesMut,
}

/// Protocol state of one client connection, independent of any I/O
pub struct ConnectionCore {
    config: ConnectionConfig,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,

    upgrade_parser: UpgradeResponseParser,
    upgrade_response: Option<UpgradeResponse>,
    first_frame_received: bool,
    preface_sent: bool,
    ack_pending: bool,
    local_settings_acked: bool,

    errors: Vec<Error>,
    invalid: bool,

    codec: FrameCodec,
    header_codec: Box<dyn HeaderCodec>,
    local_settings: Settings,
    remote_settings: Settings,
    streams: StreamManager,
    flow: ConnectionFlowControl,
    queue: WriteQueue,
    tracker: FrameTracker,
    hook: Option<Box<dyn FrameHook>>,
    open_block: Option<OpenBlock>,
    goaway: Option<GoawayFrame>,
    last_remote_stream: u32,
}

impl ConnectionCore {
    pub fn new(config: ConnectionConfig) -> Self {
        let local_settings = config.settings.clone();
        let phase = match config.mode {
            ConnectMode::Upgrade => Phase::PreUpgrade,
            ConnectMode::PriorKnowledge => Phase::AwaitingServerPreface,
        };
        let mut streams = StreamManager::new(
            true,
            DEFAULT_INITIAL_WINDOW_SIZE,
            local_settings.get_initial_window_size(),
        );
        if config.mode == ConnectMode::Upgrade {
            // The upgrade request itself is stream 1, already half-closed (local)
            if let Ok(id) = streams.create_stream() {
                if let Some(stream) = streams.get_stream_mut(id) {
                    let _ = stream.send_headers(true);
                }
            }
        }
        let (phase_tx, _) = watch::channel(phase);

        ConnectionCore {
            codec: FrameCodec::with_max_frame_size(local_settings.get_max_frame_size()),
            queue: WriteQueue::with_min_growth(config.write_queue_min_growth),
            flow: ConnectionFlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            phase,
            phase_tx,
            upgrade_parser: UpgradeResponseParser::new(),
            upgrade_response: None,
            first_frame_received: false,
            preface_sent: false,
            ack_pending: false,
            local_settings_acked: false,
            errors: Vec::new(),
            invalid: false,
            header_codec: Box::new(HpackCodec::new()),
            local_settings,
            remote_settings: Settings::new(),
            streams,
            tracker: FrameTracker::new(),
            hook: None,
            open_block: None,
            goaway: None,
            last_remote_stream: 0,
            config,
        }
    }

    /// Replace the HPACK implementation
    pub fn with_header_codec(mut self, codec: Box<dyn HeaderCodec>) -> Self {
        self.header_codec = codec;
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn FrameHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn set_hook(&mut self, hook: Option<Box<dyn FrameHook>>) {
        self.hook = hook;
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Watch phase changes
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase <= self.phase {
            return;
        }
        info!(from = ?self.phase, to = ?phase, "connection phase change");
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// Transport reached end of stream or was closed locally
    pub fn mark_closed(&mut self) {
        self.set_phase(Phase::Closed);
    }

    pub fn upgrade_response(&self) -> Option<&UpgradeResponse> {
        self.upgrade_response.as_ref()
    }

    pub fn first_frame_received(&self) -> bool {
        self.first_frame_received
    }

    pub fn is_preface_sent(&self) -> bool {
        self.preface_sent
    }

    /// A SETTINGS ACK is owed but our own SETTINGS have not gone out yet
    pub fn is_ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// The peer acknowledged our SETTINGS
    pub fn local_settings_acked(&self) -> bool {
        self.local_settings_acked
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    pub fn flow_control(&self) -> &ConnectionFlowControl {
        &self.flow
    }

    pub fn stream(&self, stream_id: u32) -> Option<&H2Stream> {
        self.streams.get_stream(stream_id)
    }

    /// GOAWAY received from the peer, if any
    pub fn goaway(&self) -> Option<&GoawayFrame> {
        self.goaway.as_ref()
    }

    pub fn tracker(&self) -> &FrameTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut FrameTracker {
        &mut self.tracker
    }

    pub fn add_expected(&mut self, expected: ExpectedFrame) {
        self.tracker.add_expected(expected);
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.errors)
    }

    /// A fatal error was seen; inbound frames are no longer processed
    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Record an error without invalidating the connection
    pub fn record_error(&mut self, error: Error) {
        warn!(category = ?error.category(), cause = %error, "connection error recorded");
        self.errors.push(error);
    }

    fn fail(&mut self, error: Error) {
        self.invalid = true;
        self.record_error(error);
    }

    /// The HTTP/1.1 request that asks for h2c
    pub fn upgrade_request(&self) -> Bytes {
        UpgradeRequest::new(
            self.config.host.clone(),
            self.config.port,
            self.config.path.clone(),
            self.local_settings.clone(),
        )
        .encode()
    }

    /// Feed bytes to the upgrade response parser.
    ///
    /// Returns `Ok(true)` once a valid 101 response is complete; any bytes
    /// after it remain in `buf`. A complete but invalid response is fatal.
    pub fn process_upgrade_bytes(&mut self, buf: &mut BytesMut) -> Result<bool> {
        if self.phase != Phase::PreUpgrade {
            return Err(Error::NotReady(format!(
                "upgrade response in phase {:?}",
                self.phase
            )));
        }
        match self.upgrade_parser.feed(buf) {
            Ok(Some(response)) => {
                self.upgrade_response = Some(response);
                self.set_phase(Phase::AwaitingServerPreface);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.invalid = true;
                Err(e.into())
            }
        }
    }

    /// Connection preface: the magic string followed by our SETTINGS
    pub fn preface_chunks(&self) -> Vec<Bytes> {
        vec![
            Bytes::from_static(CONNECTION_PREFACE),
            FrameCodec::encode_settings_frame(&SettingsFrame::new(self.local_settings.clone())),
        ]
    }

    /// Our preface is on the wire; emit the SETTINGS ACK that was held back
    pub fn mark_preface_sent(&mut self) {
        self.preface_sent = true;
        if self.ack_pending {
            self.ack_pending = false;
            debug!("sending deferred SETTINGS ACK");
            self.enqueue(&Frame::Settings(SettingsFrame::ack()));
        }
    }

    /// Process bytes read from the transport; `buf` is fully consumed
    pub fn process_read(&mut self, buf: &mut BytesMut) {
        if self.invalid {
            buf.clear();
            return;
        }

        if self.phase == Phase::PreUpgrade {
            match self.process_upgrade_bytes(buf) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.fail(e);
                    buf.clear();
                    return;
                }
            }
        }

        while !buf.is_empty() && !self.invalid {
            match self.codec.process_next_buffer(buf) {
                Ok(FrameStatus::Incomplete) => break,
                Ok(FrameStatus::Complete) | Ok(FrameStatus::CompleteWithRemainder) => {
                    if let Some(frame) = self.codec.take_frame() {
                        self.handle_frame(frame);
                    }
                }
                Err(e) => {
                    self.codec.reset();
                    self.fail(e);
                }
            }
        }
        buf.clear();
    }

    /// Apply one inbound frame
    pub fn handle_frame(&mut self, frame: Frame) {
        trace!(frame = %frame, "inbound frame");

        if !self.first_frame_received {
            self.first_frame_received = true;
            if !matches!(&frame, Frame::Settings(s) if !s.ack) {
                self.fail(SequenceError::UnexpectedFirstFrame(frame.frame_type()).into());
                return;
            }
            if self.phase == Phase::AwaitingServerPreface {
                self.set_phase(Phase::Established);
            }
        }

        let mut observed = match &frame {
            Frame::Headers(_) | Frame::PushPromise(_) | Frame::Continuation(_) => None,
            other => Some(ObservedFrame::from_frame(other)),
        };

        let outcome = self.apply_inbound(&frame);
        let ok = match outcome {
            Ok(block) => {
                observed = observed.or(block);
                true
            }
            Err(Error::StreamClosed(id)) => {
                self.record_error(Error::StreamClosed(id));
                false
            }
            Err(e) => {
                self.fail(e);
                false
            }
        };

        if let Some(observed) = observed {
            self.tracker.record_arrived(observed);
        }

        if ok {
            let replies = match self.hook.as_mut() {
                Some(hook) => hook.after_frame(&frame),
                None => Vec::new(),
            };
            for reply in replies {
                if let Err(e) = self.queue_frame(&reply) {
                    self.record_error(e);
                }
            }
        }
    }

    /// Protocol side effects of an inbound frame. Returns the observation of
    /// a header block once it is complete.
    fn apply_inbound(&mut self, frame: &Frame) -> Result<Option<ObservedFrame>> {
        if let Some(block) = &self.open_block {
            let continues = matches!(frame, Frame::Continuation(c) if c.stream_id == block.stream_id);
            if !continues {
                let open_stream = block.stream_id;
                self.open_block = None;
                return Err(SequenceError::HeaderBlockInterrupted {
                    stream_id: frame.stream_id(),
                    open_stream,
                    frame_type: frame.frame_type(),
                }
                .into());
            }
        }

        match frame {
            Frame::Settings(settings) if settings.ack => {
                debug!("peer acknowledged our SETTINGS");
                self.local_settings_acked = true;
            }
            Frame::Settings(settings) => self.apply_remote_settings(&settings.settings)?,
            Frame::Ping(ping) => {
                if !ping.ack {
                    self.enqueue(&Frame::Ping(PingFrame::ack(ping.data)));
                }
            }
            Frame::WindowUpdate(update) => {
                if update.stream_id == CONNECTION_STREAM_ID {
                    self.flow.increase_send(update.size_increment)?;
                } else if let Some(stream) = self.streams.get_stream_mut(update.stream_id) {
                    stream.flow_control_mut().increase_send(update.size_increment)?;
                } else {
                    debug!(stream_id = update.stream_id, "WINDOW_UPDATE for unknown stream");
                }
            }
            Frame::Data(data) => self.receive_data(data)?,
            Frame::Headers(headers) => {
                let stream = self.streams.get_or_create_stream(headers.stream_id);
                stream.receive_headers(headers.end_stream)?;
                if let Some(priority) = headers.priority {
                    stream.set_priority(priority);
                }
                return self.start_block(
                    headers.stream_id,
                    BlockKind::Headers {
                        end_stream: headers.end_stream,
                    },
                    &headers.header_block,
                    headers.end_headers,
                );
            }
            Frame::PushPromise(promise) => {
                self.streams
                    .get_or_create_stream(promise.promised_stream_id)
                    .reserve_remote()?;
                self.last_remote_stream = self.last_remote_stream.max(promise.promised_stream_id);
                return self.start_block(
                    promise.stream_id,
                    BlockKind::PushPromise,
                    &promise.header_block,
                    promise.end_headers,
                );
            }
            Frame::Continuation(continuation) => {
                let Some(block) = self.open_block.as_mut() else {
                    return Err(SequenceError::HeadersAfterEndHeaders {
                        stream_id: continuation.stream_id,
                        frame_type: FrameType::Continuation,
                    }
                    .into());
                };
                block.fragments.extend_from_slice(&continuation.header_block);
                if continuation.end_headers {
                    if let Some(block) = self.open_block.take() {
                        return self.finish_block(block).map(Some);
                    }
                }
            }
            Frame::RstStream(rst) => {
                debug!(stream_id = rst.stream_id, code = %rst.error_code, "stream reset by peer");
                self.streams.get_or_create_stream(rst.stream_id).reset();
            }
            Frame::Priority(priority) => {
                self.streams
                    .get_or_create_stream(priority.stream_id)
                    .set_priority(priority.priority);
            }
            Frame::Goaway(goaway) => {
                info!(
                    last_stream_id = goaway.last_stream_id,
                    code = %goaway.error_code,
                    "GOAWAY received"
                );
                self.goaway = Some(goaway.clone());
                self.set_phase(Phase::Closing);
                if goaway.error_code != ErrorCode::NoError && !self.tracker.expects(FrameType::Goaway) {
                    return Err(SequenceError::UnexpectedGoaway {
                        last_stream_id: goaway.last_stream_id,
                        error_code: goaway.error_code,
                    }
                    .into());
                }
            }
        }
        Ok(None)
    }

    fn apply_remote_settings(&mut self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        if let Some(size) = settings.initial_window_size {
            self.streams.update_send_initial(size)?;
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.streams.set_max_concurrent_streams(Some(max));
        }
        self.remote_settings.merge(settings);
        debug!(?settings, "peer SETTINGS applied");

        if self.preface_sent {
            self.enqueue(&Frame::Settings(SettingsFrame::ack()));
        } else {
            debug!("holding SETTINGS ACK until our preface is sent");
            self.ack_pending = true;
        }
        Ok(())
    }

    fn receive_data(&mut self, data: &DataFrame) -> Result<()> {
        let flow_len = data.frame_size();
        let stream = self.streams.get_or_create_stream(data.stream_id);
        stream.receive_data(flow_len, data.end_stream)?;
        let stream_update = if self.config.auto_window_update && !stream.remote_ended() {
            stream.flow_control_mut().take_window_update()
        } else {
            None
        };
        self.flow.consume_recv(flow_len)?;

        if self.config.auto_window_update {
            if let Some(increment) = self.flow.take_window_update() {
                self.enqueue(&Frame::WindowUpdate(WindowUpdateFrame::new(
                    CONNECTION_STREAM_ID,
                    increment,
                )));
            }
            if let Some(increment) = stream_update {
                self.enqueue(&Frame::WindowUpdate(WindowUpdateFrame::new(
                    data.stream_id,
                    increment,
                )));
            }
        }
        Ok(())
    }

    fn start_block(
        &mut self,
        stream_id: u32,
        kind: BlockKind,
        fragment: &Bytes,
        end_headers: bool,
    ) -> Result<Option<ObservedFrame>> {
        let block = OpenBlock {
            stream_id,
            kind,
            fragments: BytesMut::from(&fragment[..]),
        };
        if end_headers {
            self.finish_block(block).map(Some)
        } else {
            self.open_block = Some(block);
            Ok(None)
        }
    }

    fn finish_block(&mut self, block: OpenBlock) -> Result<ObservedFrame> {
        let fields = self.header_codec.decode_headers(&block.fragments)?;
        debug!(stream_id = block.stream_id, fields = fields.len(), "header block complete");
        Ok(match block.kind {
            BlockKind::Headers { end_stream } => {
                ObservedFrame::headers(block.stream_id, fields, end_stream)
            }
            BlockKind::PushPromise => ObservedFrame::push_promise(block.stream_id, fields),
        })
    }

    fn enqueue(&mut self, frame: &Frame) {
        trace!(frame = %frame, "queueing frame");
        self.queue.enqueue(FrameCodec::build_frame_for_write(frame));
    }

    /// Apply outbound rules for `frame` and return its chunks without queueing
    pub fn prepare_frame(&mut self, frame: &Frame) -> Result<Vec<Bytes>> {
        if self.phase == Phase::Closed {
            return Err(Error::ConnectionClosed);
        }

        let max_frame_size = self.remote_settings.get_max_frame_size() as usize;
        match frame {
            Frame::Headers(headers) => {
                check_frame_size(headers.header_block.len(), max_frame_size)?;
                self.streams
                    .get_or_create_stream(headers.stream_id)
                    .send_headers(headers.end_stream)?;
            }
            Frame::Data(data) => {
                let flow_len = data.frame_size();
                check_frame_size(flow_len, max_frame_size)?;
                if !self.flow.send_window().can_send(flow_len) {
                    return Err(Error::FlowControl(format!(
                        "{} bytes exceed connection send window of {}",
                        flow_len,
                        self.flow.send_window().size()
                    )));
                }
                self.streams
                    .get_stream_mut(data.stream_id)
                    .ok_or(Error::StreamClosed(data.stream_id))?
                    .send_data(flow_len, data.end_stream)?;
                self.flow.consume_send(flow_len)?;
            }
            Frame::RstStream(rst) => {
                if let Some(stream) = self.streams.get_stream_mut(rst.stream_id) {
                    stream.reset();
                }
            }
            Frame::Settings(settings) if !settings.ack => {
                settings.settings.validate()?;
                self.local_settings.merge(&settings.settings);
                self.codec
                    .set_max_frame_size(self.local_settings.get_max_frame_size());
            }
            Frame::Goaway(_) => self.set_phase(Phase::Closing),
            _ => {}
        }
        Ok(FrameCodec::build_frame_for_write(frame))
    }

    /// Apply outbound rules and add `frame` to the pending-write queue
    pub fn queue_frame(&mut self, frame: &Frame) -> Result<()> {
        let chunks = self.prepare_frame(frame)?;
        trace!(frame = %frame, "queueing frame");
        self.queue.enqueue(chunks);
        Ok(())
    }

    /// Everything queued since the last call, in order
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        self.queue.drain()
    }

    pub fn pending_writes(&self) -> &WriteQueue {
        &self.queue
    }

    /// HPACK-encode with the connection's encoder
    pub fn encode_headers(&mut self, fields: &[HeaderField]) -> Result<Bytes> {
        self.header_codec.encode_headers(fields)
    }

    /// Open a new stream and queue HEADERS (and DATA when `body` is given).
    /// Encoding and queueing happen together so HPACK state matches wire order.
    pub fn queue_request(&mut self, fields: &[HeaderField], body: Option<Bytes>) -> Result<u32> {
        if self.phase >= Phase::Closing {
            return Err(Error::NotReady(format!("new stream in phase {:?}", self.phase)));
        }
        let stream_id = self.streams.create_stream()?;
        let block = self.encode_headers(fields)?;
        self.queue_frame(&Frame::Headers(HeadersFrame::new(
            stream_id,
            block,
            body.is_none(),
            true,
        )))?;
        if let Some(body) = body {
            self.queue_frame(&Frame::Data(DataFrame::new(stream_id, body, true)))?;
        }
        Ok(stream_id)
    }

    /// Highest stream id the peer initiated
    pub fn last_remote_stream(&self) -> u32 {
        self.last_remote_stream
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("phase", &self.phase)
            .field("preface_sent", &self.preface_sent)
            .field("ack_pending", &self.ack_pending)
            .field("invalid", &self.invalid)
            .field("errors", &self.errors.len())
            .field("pending_writes", &self.queue.len())
            .finish_non_exhaustive()
    }
}

fn check_frame_size(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::FrameSize(format!(
            "{} byte payload exceeds peer max frame size {}",
            len, max
        )));
    }
    Ok(())
}

struct Shared {
    core: Mutex<ConnectionCore>,
    writer: tokio::sync::Mutex<TransportWriter>,
    closed: AtomicBool,
    pool: Arc<BufferPool>,
    read_buffer_size: usize,
    close_checks: Vec<Duration>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, ConnectionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write queued chunks until the queue stays empty
    async fn flush(&self) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let mut total = 0;
        loop {
            let chunks = self.core().take_outbound();
            if chunks.is_empty() {
                return Ok(total);
            }
            total += writer.write_chunks(&chunks).await?;
        }
    }
}

/// A client HTTP/2 connection running over a transport
pub struct H2Connection {
    shared: Arc<Shared>,
    phase_rx: watch::Receiver<Phase>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl H2Connection {
    /// Connect over TCP to the configured host and port, then handshake
    pub async fn connect(config: ConnectionConfig, pool: Arc<BufferPool>) -> Result<Self> {
        let stream = transport::connect(
            &config.host,
            config.port,
            config.connect_timeout,
            config.tcp_nodelay,
        )
        .await?;
        Self::handshake(stream, config, pool).await
    }

    /// Handshake over an already connected transport
    pub async fn handshake<T: Transport>(
        io: T,
        config: ConnectionConfig,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        Self::handshake_with(io, ConnectionCore::new(config), pool).await
    }

    /// Handshake using a prepared core (custom hook or header codec)
    pub async fn handshake_with<T: Transport>(
        io: T,
        mut core: ConnectionCore,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        let config = core.config().clone();
        let (mut reader, mut writer) = transport::split(io, config.write_timeout);
        let mut buf = pool.acquire(config.read_buffer_size);

        let result = Self::exchange_prefaces(&mut core, &mut reader, &mut writer, &mut buf, &config).await;
        if let Err(e) = result {
            pool.release(buf);
            writer.shutdown().await;
            return Err(e);
        }

        let phase_rx = core.subscribe();
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            writer: tokio::sync::Mutex::new(writer),
            closed: AtomicBool::new(false),
            pool,
            read_buffer_size: config.read_buffer_size,
            close_checks: config.close_checks.clone(),
        });

        let flushed = shared.flush().await;
        let read_task = tokio::spawn(read_loop(shared.clone(), reader, buf));
        let connection = H2Connection {
            shared,
            phase_rx,
            read_task: Mutex::new(Some(read_task)),
        };
        if let Err(e) = flushed {
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Upgrade (when configured) and send our preface. Bytes the server sent
    /// right behind its 101 are processed before the preface is written, so a
    /// SETTINGS arriving that early has its ACK held until the preface is out.
    async fn exchange_prefaces(
        core: &mut ConnectionCore,
        reader: &mut TransportReader,
        writer: &mut TransportWriter,
        buf: &mut BytesMut,
        config: &ConnectionConfig,
    ) -> Result<()> {
        if core.phase() == Phase::PreUpgrade {
            writer.write_chunks(&[core.upgrade_request()]).await?;
            let deadline = tokio::time::Instant::now() + config.handshake_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                if reader.read_buf_timeout(buf, remaining).await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
                if core.process_upgrade_bytes(buf)? {
                    break;
                }
            }
        }

        if !buf.is_empty() {
            core.process_read(buf);
        }

        let preface = core.preface_chunks();
        if core.is_ack_pending() {
            match tokio::time::timeout(config.preface_wait, writer.write_chunks(&preface)).await {
                Ok(written) => {
                    written?;
                }
                Err(_) => {
                    core.record_error(Error::SettingsTimeout);
                    return Err(Error::SettingsTimeout);
                }
            }
        } else {
            writer.write_chunks(&preface).await?;
        }
        core.mark_preface_sent();
        debug!(phase = ?core.phase(), "client preface sent");
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.shared.core().phase()
    }

    /// Run `f` with exclusive access to the protocol state
    pub fn with_core<R>(&self, f: impl FnOnce(&mut ConnectionCore) -> R) -> R {
        f(&mut self.shared.core())
    }

    pub fn add_expected(&self, expected: ExpectedFrame) {
        self.shared.core().add_expected(expected);
    }

    pub fn with_tracker<R>(&self, f: impl FnOnce(&FrameTracker) -> R) -> R {
        f(self.shared.core().tracker())
    }

    pub fn set_hook(&self, hook: Option<Box<dyn FrameHook>>) {
        self.shared.core().set_hook(hook);
    }

    pub fn take_errors(&self) -> Vec<Error> {
        self.shared.core().take_errors()
    }

    pub fn is_invalid(&self) -> bool {
        self.shared.core().is_invalid()
    }

    /// Send a frame.
    ///
    /// Before the connection is established the frame is written straight to
    /// the transport with the write timeout. Afterwards it is queued and
    /// flushed through the single writer.
    pub async fn send_frame(&self, frame: &Frame) -> Result<SendOutcome> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let phase = self.phase();
        if phase < Phase::Established {
            let mut writer = self.shared.writer.lock().await;
            let chunks = {
                let mut core = self.shared.core();
                let prepared = core.prepare_frame(frame)?;
                let mut chunks = core.take_outbound();
                chunks.extend(prepared);
                chunks
            };
            let written = writer.write_chunks(&chunks).await?;
            return Ok(SendOutcome::Written(written));
        }

        self.shared.core().queue_frame(frame)?;
        self.shared.flush().await?;
        Ok(SendOutcome::Queued)
    }

    /// Write anything queued
    pub async fn flush(&self) -> Result<usize> {
        self.shared.flush().await
    }

    /// Open a stream with `fields` as request headers and an optional body
    pub async fn request(&self, fields: Vec<HeaderField>, body: Option<Bytes>) -> Result<u32> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let stream_id = self.shared.core().queue_request(&fields, body)?;
        self.shared.flush().await?;
        Ok(stream_id)
    }

    /// Send GOAWAY and move to `Closing`
    pub async fn goaway(&self, error_code: ErrorCode, debug_data: Bytes) -> Result<SendOutcome> {
        let last = self.shared.core().last_remote_stream();
        self.send_frame(&Frame::Goaway(GoawayFrame::new(last, error_code, debug_data)))
            .await
    }

    /// Wait until the phase is at least `target`; returns the phase reached
    pub async fn wait_for_phase(&self, target: Phase, timeout: Duration) -> Result<Phase> {
        let mut rx = self.phase_rx.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|phase| *phase >= target)).await {
            Ok(Ok(phase)) => Ok(*phase),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout),
        };
        result
    }

    /// Wait for the server's SETTINGS
    pub async fn wait_established(&self, timeout: Duration) -> Result<()> {
        match self.wait_for_phase(Phase::Established, timeout).await? {
            Phase::Closed => Err(Error::ConnectionClosed),
            _ => Ok(()),
        }
    }

    /// After a GOAWAY, check that the peer closes the transport. Waits for
    /// each configured interval in turn; if the connection is still open
    /// afterwards, records and returns [`Error::NotClosed`].
    pub async fn wait_for_close(&self) -> Result<()> {
        let mut waited = Duration::ZERO;
        for check in &self.shared.close_checks {
            if self.wait_for_phase(Phase::Closed, *check).await.is_ok() {
                return Ok(());
            }
            waited += *check;
            info!(waited = ?waited, "connection still open after GOAWAY");
        }
        self.shared.core().record_error(Error::NotClosed(waited));
        Err(Error::NotClosed(waited))
    }

    /// Stop reading, shut down the writer and mark the connection closed
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shared.writer.lock().await.shutdown().await;
        self.shared.core().mark_closed();
        debug!("connection closed locally");
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: TransportReader, mut buf: BytesMut) {
    loop {
        buf.reserve(shared.read_buffer_size);
        let result = reader.read_buf(&mut buf).await;
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        match result {
            Ok(0) => {
                debug!("peer closed the connection");
                shared.core().mark_closed();
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "transport read");
                shared.core().process_read(&mut buf);
                if let Err(e) = shared.flush().await {
                    shared.core().record_error(e);
                }
            }
            Err(e) => {
                let mut core = shared.core();
                core.record_error(Error::Io(e));
                core.mark_closed();
                break;
            }
        }
    }
    buf.clear();
    shared.pool.release(buf);
}
