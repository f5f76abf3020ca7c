//! HTTP/2 stream management
//!
//! Per-stream state as defined in RFC 7540 Section 5.1, tracked from the
//! client's point of view. Inbound frames are checked against the state so
//! that a frame arriving after the peer ended the stream is reported as a
//! sequencing violation rather than silently accepted.

use super::error::{Error, Result, SequenceError};
use super::flow_control::StreamFlowControl;
use super::frames::{FrameType, PrioritySpec};
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// PUSH_PROMISE sent
    ReservedLocal,
    /// PUSH_PROMISE received
    ReservedRemote,
    Open,
    /// We sent END_STREAM
    HalfClosedLocal,
    /// Peer sent END_STREAM
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow: StreamFlowControl,
    priority: Option<PrioritySpec>,
    /// Peer sent END_STREAM
    remote_ended: bool,
    /// Stream was reset by either side
    reset: bool,
    /// Flow-controlled bytes received so far
    received: usize,
}

impl H2Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow: StreamFlowControl::new(send_window, recv_window),
            priority: None,
            remote_ended: false,
            reset: false,
            received: 0,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow_control(&self) -> &StreamFlowControl {
        &self.flow
    }

    pub fn flow_control_mut(&mut self) -> &mut StreamFlowControl {
        &mut self.flow
    }

    pub fn priority(&self) -> Option<&PrioritySpec> {
        self.priority.as_ref()
    }

    pub fn set_priority(&mut self, priority: PrioritySpec) {
        self.priority = Some(priority);
    }

    /// Whether the peer has ended its side of the stream
    pub fn remote_ended(&self) -> bool {
        self.remote_ended
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn bytes_received(&self) -> usize {
        self.received
    }

    fn check_not_ended(&self, frame_type: FrameType) -> Result<()> {
        if self.remote_ended {
            return Err(SequenceError::FrameAfterEndStream {
                stream_id: self.id,
                frame_type,
            }
            .into());
        }
        if self.reset {
            return Err(Error::StreamClosed(self.id));
        }
        Ok(())
    }

    fn end_remote(&mut self) {
        self.remote_ended = true;
        self.state = match self.state {
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    fn end_local(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    /// Inbound HEADERS (initial response headers or trailers)
    pub fn receive_headers(&mut self, end_stream: bool) -> Result<()> {
        self.check_not_ended(FrameType::Headers)?;
        match self.state {
            StreamState::Idle => self.state = StreamState::Open,
            StreamState::ReservedRemote => self.state = StreamState::HalfClosedLocal,
            StreamState::Open | StreamState::HalfClosedLocal => {}
            state => {
                return Err(Error::Protocol(format!(
                    "HEADERS on stream {} in state {:?}",
                    self.id, state
                )))
            }
        }
        if end_stream {
            self.end_remote();
        }
        Ok(())
    }

    /// Inbound DATA; `flow_len` includes padding
    pub fn receive_data(&mut self, flow_len: usize, end_stream: bool) -> Result<()> {
        self.check_not_ended(FrameType::Data)?;
        if !self.state.can_receive() {
            return Err(Error::Protocol(format!(
                "DATA on stream {} in state {:?}",
                self.id, self.state
            )));
        }
        self.flow.consume_recv(flow_len)?;
        self.received += flow_len;
        if end_stream {
            self.end_remote();
        }
        Ok(())
    }

    /// Peer promised this stream with PUSH_PROMISE
    pub fn reserve_remote(&mut self) -> Result<()> {
        if self.state != StreamState::Idle {
            return Err(Error::Protocol(format!(
                "PUSH_PROMISE for stream {} in state {:?}",
                self.id, self.state
            )));
        }
        self.state = StreamState::ReservedRemote;
        Ok(())
    }

    /// Outbound HEADERS
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => self.state = StreamState::Open,
            StreamState::ReservedLocal => self.state = StreamState::HalfClosedRemote,
            StreamState::Open | StreamState::HalfClosedRemote => {}
            state => {
                return Err(Error::Protocol(format!(
                    "cannot send HEADERS on stream {} in state {:?}",
                    self.id, state
                )))
            }
        }
        if end_stream {
            self.end_local();
        }
        Ok(())
    }

    /// Outbound DATA; consumes the stream send window
    pub fn send_data(&mut self, flow_len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }
        self.flow.consume_send(flow_len)?;
        if end_stream {
            self.end_local();
        }
        Ok(())
    }

    /// RST_STREAM sent or received
    pub fn reset(&mut self) {
        self.reset = true;
        self.state = StreamState::Closed;
    }
}

/// All streams of one connection
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Client: odd, server: even
    next_stream_id: StreamId,
    max_concurrent_streams: Option<u32>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE
    send_initial: u32,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE
    recv_initial: u32,
}

impl StreamManager {
    pub fn new(is_client: bool, send_initial: u32, recv_initial: u32) -> Self {
        StreamManager {
            streams: HashMap::new(),
            next_stream_id: if is_client { 1 } else { 2 },
            max_concurrent_streams: None,
            send_initial,
            recv_initial,
        }
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn peek_next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }

    /// Allocate the next locally initiated stream
    pub fn create_stream(&mut self) -> Result<StreamId> {
        if let Some(max) = self.max_concurrent_streams {
            if self.active_stream_count() >= max as usize {
                return Err(Error::TooManyStreams);
            }
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.streams.insert(
            stream_id,
            H2Stream::new(stream_id, self.send_initial, self.recv_initial),
        );
        Ok(stream_id)
    }

    pub fn get_stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Look up a stream, creating it in the idle state on first use
    pub fn get_or_create_stream(&mut self, stream_id: StreamId) -> &mut H2Stream {
        let (send, recv) = (self.send_initial, self.recv_initial);
        if stream_id >= self.next_stream_id && stream_id % 2 == self.next_stream_id % 2 {
            self.next_stream_id = stream_id + 2;
        }
        self.streams
            .entry(stream_id)
            .or_insert_with(|| H2Stream::new(stream_id, send, recv))
    }

    /// Apply a new peer SETTINGS_INITIAL_WINDOW_SIZE to every stream
    pub fn update_send_initial(&mut self, size: u32) -> Result<()> {
        self.send_initial = size;
        for stream in self.streams.values_mut() {
            stream.flow_control_mut().update_send_initial(size)?;
        }
        Ok(())
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !s.state().is_closed())
            .count()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
