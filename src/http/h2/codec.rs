//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec`] is the stateful parser used by a connection: it pulls
//! bytes out of whatever the transport delivered, keeps partial frames
//! across reads and hands back one [`Frame`] at a time. The `encode_*`
//! helpers build single-buffer encodings with full control over flags and
//! padding, which is handy for crafting test traffic.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::settings::Settings;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Outcome of feeding one buffer to [`FrameCodec::process_next_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// All input consumed, no complete frame yet; read more before calling again
    Incomplete,
    /// A frame is ready and the input buffer is empty
    Complete,
    /// A frame is ready and the input buffer still holds the following bytes
    CompleteWithRemainder,
}

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    /// Raw type code; may name a type this crate does not know
    pub kind: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }
}

/// Stateful HTTP/2 frame parser and serializer
#[derive(Debug)]
pub struct FrameCodec {
    /// Bytes of the frame currently being assembled
    pending: BytesMut,
    max_frame_size: u32,
    frame: Option<Frame>,
}

impl FrameCodec {
    /// Create a codec accepting payloads up to the default max frame size
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        FrameCodec {
            pending: BytesMut::with_capacity(FRAME_HEADER_SIZE + 1024),
            max_frame_size,
            frame: None,
        }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Bytes held for a frame that has not fully arrived
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.pending.clear();
        self.frame = None;
    }

    /// Take the frame produced by the last `Complete`/`CompleteWithRemainder`
    pub fn take_frame(&mut self) -> Option<Frame> {
        self.frame.take()
    }

    /// Consume bytes from `buf` until one frame is complete or `buf` is empty.
    ///
    /// Frames of unknown type are discarded and parsing continues with the
    /// bytes that follow them.
    pub fn process_next_buffer(&mut self, buf: &mut BytesMut) -> Result<FrameStatus> {
        loop {
            if !self.fill(buf, FRAME_HEADER_SIZE) {
                return Ok(FrameStatus::Incomplete);
            }

            let header = Self::decode_header(&self.pending[..FRAME_HEADER_SIZE]);
            if header.length > self.max_frame_size as usize {
                self.pending.clear();
                return Err(Error::FrameSize(format!(
                    "frame payload of {} bytes exceeds max frame size {}",
                    header.length, self.max_frame_size
                )));
            }

            if !self.fill(buf, FRAME_HEADER_SIZE + header.length) {
                return Ok(FrameStatus::Incomplete);
            }

            let mut raw = self.pending.split().freeze();
            raw.advance(FRAME_HEADER_SIZE);

            match Self::decode_payload(&header, raw)? {
                Some(frame) => {
                    trace!(frame = %frame, length = header.length, "frame parsed");
                    self.frame = Some(frame);
                    return Ok(if buf.is_empty() {
                        FrameStatus::Complete
                    } else {
                        FrameStatus::CompleteWithRemainder
                    });
                }
                None => {
                    trace!(kind = header.kind, length = header.length, "discarding unknown frame type");
                    if buf.is_empty() {
                        return Ok(FrameStatus::Incomplete);
                    }
                }
            }
        }
    }

    /// Move bytes from `buf` until `pending` holds `target` bytes
    fn fill(&mut self, buf: &mut BytesMut, target: usize) -> bool {
        if self.pending.len() < target {
            let take = (target - self.pending.len()).min(buf.len());
            self.pending.extend_from_slice(&buf.split_to(take));
        }
        self.pending.len() >= target
    }

    /// Parse exactly one complete frame from `bytes`
    pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
        let mut codec = FrameCodec::with_max_frame_size(MAX_FRAME_SIZE as u32);
        let mut buf = BytesMut::from(bytes);
        match codec.process_next_buffer(&mut buf)? {
            FrameStatus::Complete => codec
                .take_frame()
                .ok_or_else(|| Error::Internal("codec reported a frame but held none".into())),
            FrameStatus::CompleteWithRemainder => Err(Error::Protocol(format!(
                "{} trailing bytes after frame",
                buf.len()
            ))),
            FrameStatus::Incomplete => Err(Error::Protocol(format!(
                "incomplete or unknown frame ({} bytes)",
                bytes.len()
            ))),
        }
    }

    /// Serialize a frame into the chunks one transport write must carry.
    ///
    /// DATA frames yield the header (with the pad length octet when padded),
    /// the payload itself without copying, and the padding. Every other frame
    /// is a single chunk.
    pub fn build_frame_for_write(frame: &Frame) -> Vec<Bytes> {
        match frame {
            Frame::Data(data) => {
                let mut head = BytesMut::with_capacity(FRAME_HEADER_SIZE + 1);
                head.put_slice(&Self::encode_header(
                    FrameType::Data,
                    frame.flags(),
                    data.stream_id,
                    data.frame_size(),
                ));
                let mut chunks = Vec::with_capacity(3);
                match data.padding {
                    Some(pad_len) => {
                        head.put_u8(pad_len);
                        chunks.push(head.freeze());
                        chunks.push(data.data.clone());
                        if pad_len > 0 {
                            chunks.push(Bytes::from(vec![0u8; pad_len as usize]));
                        }
                    }
                    None => {
                        chunks.push(head.freeze());
                        chunks.push(data.data.clone());
                    }
                }
                chunks
            }
            other => vec![Self::encode_frame(other)],
        }
    }

    /// Serialize any frame into one contiguous buffer
    pub fn encode_frame(frame: &Frame) -> Bytes {
        match frame {
            Frame::Data(f) => Self::encode_data_frame(f),
            Frame::Headers(f) => Self::encode_headers_frame(f),
            Frame::Priority(f) => Self::encode_priority_frame(f),
            Frame::RstStream(f) => Self::encode_rst_stream_frame(f),
            Frame::Settings(f) => Self::encode_settings_frame(f),
            Frame::PushPromise(f) => Self::encode_push_promise_frame(f),
            Frame::Ping(f) => Self::encode_ping_frame(f),
            Frame::Goaway(f) => Self::encode_goaway_frame(f),
            Frame::WindowUpdate(f) => Self::encode_window_update_frame(f),
            Frame::Continuation(f) => Self::encode_continuation_frame(f),
        }
    }

    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;
        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();
        // Reserved bit is always sent as 0
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());

        header
    }

    /// Decode a frame header; `bytes` must hold at least 9 bytes
    pub fn decode_header(bytes: &[u8]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Decode a payload; `Ok(None)` for unknown frame types
    pub fn decode_payload(header: &FrameHeader, mut payload: Bytes) -> Result<Option<Frame>> {
        let Some(frame_type) = header.frame_type() else {
            return Ok(None);
        };
        let flags = header.flags;
        let stream_id = header.stream_id;

        if frame_type.requires_stream() && stream_id == 0 {
            return Err(Error::Protocol(format!("{} frame on stream 0", frame_type)));
        }
        if frame_type.is_connection_level() && stream_id != 0 {
            return Err(Error::Protocol(format!(
                "{} frame on stream {}, must be 0",
                frame_type, stream_id
            )));
        }

        let frame = match frame_type {
            FrameType::Data => {
                let padding = strip_padding(frame_type, flags, &mut payload)?;
                Frame::Data(DataFrame {
                    stream_id,
                    data: payload,
                    end_stream: flags.is_end_stream(),
                    padding,
                })
            }
            FrameType::Headers => {
                let padding = strip_padding(frame_type, flags, &mut payload)?;
                let priority = if flags.is_priority() {
                    expect_at_least(frame_type, &payload, 5)?;
                    Some(read_priority(&mut payload))
                } else {
                    None
                };
                Frame::Headers(HeadersFrame {
                    stream_id,
                    header_block: payload,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                })
            }
            FrameType::Priority => {
                expect_length(frame_type, &payload, 5)?;
                Frame::Priority(PriorityFrame::new(stream_id, read_priority(&mut payload)))
            }
            FrameType::RstStream => {
                expect_length(frame_type, &payload, 4)?;
                Frame::RstStream(RstStreamFrame::new(
                    stream_id,
                    ErrorCode::from_wire(payload.get_u32()),
                ))
            }
            FrameType::Settings => {
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(Error::FrameSize(format!(
                            "SETTINGS ACK with {} byte payload",
                            payload.len()
                        )));
                    }
                    Frame::Settings(SettingsFrame::ack())
                } else {
                    Frame::Settings(SettingsFrame::new(Settings::decode_payload(&payload)?))
                }
            }
            FrameType::PushPromise => {
                let padding = strip_padding(frame_type, flags, &mut payload)?;
                expect_at_least(frame_type, &payload, 4)?;
                let promised_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                    padding,
                })
            }
            FrameType::Ping => {
                expect_length(frame_type, &payload, 8)?;
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                })
            }
            FrameType::Goaway => {
                expect_at_least(frame_type, &payload, 8)?;
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Frame::Goaway(GoawayFrame::new(last_stream_id, error_code, payload))
            }
            FrameType::WindowUpdate => {
                expect_length(frame_type, &payload, 4)?;
                let size_increment = payload.get_u32() & 0x7FFF_FFFF;
                if size_increment == 0 {
                    return Err(Error::Protocol(format!(
                        "WINDOW_UPDATE with zero increment on stream {}",
                        stream_id
                    )));
                }
                Frame::WindowUpdate(WindowUpdateFrame::new(stream_id, size_increment))
            }
            FrameType::Continuation => Frame::Continuation(ContinuationFrame::new(
                stream_id,
                payload,
                flags.is_end_headers(),
            )),
        };

        Ok(Some(frame))
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.frame_size());
        let flags = Frame::Data(frame.clone()).flags();
        buf.put_slice(&Self::encode_header(
            FrameType::Data,
            flags,
            frame.stream_id,
            frame.frame_size(),
        ));
        put_padded(&mut buf, frame.padding, |buf| buf.put_slice(&frame.data));
        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut payload_len = frame.header_block.len();
        if frame.priority.is_some() {
            payload_len += 5;
        }
        if let Some(pad_len) = frame.padding {
            payload_len += 1 + pad_len as usize;
        }

        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        flags.set_if(FrameFlags::PRIORITY, frame.priority.is_some());
        flags.set_if(FrameFlags::PADDED, frame.padding.is_some());

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len));
        put_padded(&mut buf, frame.padding, |buf| {
            if let Some(priority) = &frame.priority {
                put_priority(buf, priority);
            }
            buf.put_slice(&frame.header_block);
        });
        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        buf.put_slice(&Self::encode_header(
            FrameType::Priority,
            FrameFlags::empty(),
            frame.stream_id,
            5,
        ));
        put_priority(&mut buf, &frame.priority);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    /// Encode a SETTINGS frame (ACKs always carry an empty payload)
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let payload = if frame.ack {
            Bytes::new()
        } else {
            frame.settings.encode_payload()
        };
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(FrameType::Settings, flags, 0, payload.len()));
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Encode a PUSH_PROMISE frame
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame) -> Bytes {
        let mut payload_len = 4 + frame.header_block.len();
        if let Some(pad_len) = frame.padding {
            payload_len += 1 + pad_len as usize;
        }
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        flags.set_if(FrameFlags::PADDED, frame.padding.is_some());

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(
            FrameType::PushPromise,
            flags,
            frame.stream_id,
            payload_len,
        ));
        put_padded(&mut buf, frame.padding, |buf| {
            buf.put_u32(frame.promised_stream_id & 0x7FFF_FFFF);
            buf.put_slice(&frame.header_block);
        });
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let payload_len = 8 + frame.debug_data.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(
            FrameType::Goaway,
            FrameFlags::empty(),
            0,
            payload_len,
        ));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());
        buf.put_slice(&Self::encode_header(
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        ));
        buf.put_slice(&frame.header_block);
        buf.freeze()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn put_padded(buf: &mut BytesMut, padding: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(pad_len) = padding {
        buf.put_u8(pad_len);
        body(buf);
        buf.put_bytes(0, pad_len as usize);
    } else {
        body(buf);
    }
}

fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

fn read_priority(payload: &mut Bytes) -> PrioritySpec {
    let dep = payload.get_u32();
    let weight = payload.get_u8();
    PrioritySpec::new(dep & 0x7FFF_FFFF, dep & 0x8000_0000 != 0, weight)
}

/// Remove the pad length octet and trailing padding, returning the pad length
fn strip_padding(frame_type: FrameType, flags: FrameFlags, payload: &mut Bytes) -> Result<Option<u8>> {
    if !flags.is_padded() {
        return Ok(None);
    }
    expect_at_least(frame_type, payload, 1)?;
    let pad_len = payload.get_u8();
    if pad_len as usize > payload.len() {
        return Err(Error::Protocol(format!(
            "{} padding of {} bytes exceeds remaining payload of {}",
            frame_type,
            pad_len,
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad_len as usize);
    Ok(Some(pad_len))
}

fn expect_length(frame_type: FrameType, payload: &Bytes, len: usize) -> Result<()> {
    if payload.len() != len {
        return Err(Error::Protocol(format!(
            "{} payload must be {} bytes, got {}",
            frame_type,
            len,
            payload.len()
        )));
    }
    Ok(())
}

fn expect_at_least(frame_type: FrameType, payload: &Bytes, len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(Error::Protocol(format!(
            "{} payload too short: {} bytes, need {}",
            frame_type,
            payload.len(),
            len
        )));
    }
    Ok(())
}
