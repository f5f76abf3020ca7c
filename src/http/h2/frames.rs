//! HTTP/2 frame types and utilities
//!
//! This module defines the frame types specified in RFC 7540 Section 6.
//! [`Frame`] is a tagged union over the typed frames; a parsed frame is an
//! immutable value that compares structurally with any other frame.

use super::error::ErrorCode;
use super::settings::Settings;
use super::CONNECTION_STREAM_ID;
use bytes::Bytes;
use std::fmt;

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FrameType {
    /// DATA frame (0x0) - Conveys arbitrary, variable-length sequences of octets
    Data = 0x0,
    /// HEADERS frame (0x1) - Opens a stream and carries header block fragment
    Headers = 0x1,
    /// PRIORITY frame (0x2) - Specifies sender-advised priority of a stream
    Priority = 0x2,
    /// RST_STREAM frame (0x3) - Allows immediate termination of a stream
    RstStream = 0x3,
    /// SETTINGS frame (0x4) - Conveys configuration parameters
    Settings = 0x4,
    /// PUSH_PROMISE frame (0x5) - Used to notify peer of intent to initiate stream
    PushPromise = 0x5,
    /// PING frame (0x6) - Mechanism for measuring round-trip time
    Ping = 0x6,
    /// GOAWAY frame (0x7) - Initiates shutdown of connection
    Goaway = 0x7,
    /// WINDOW_UPDATE frame (0x8) - Implements flow control
    WindowUpdate = 0x8,
    /// CONTINUATION frame (0x9) - Continues sequence of header block fragments
    Continuation = 0x9,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }

    /// Whether frames of this type must carry stream id 0
    pub fn is_connection_level(&self) -> bool {
        matches!(self, FrameType::Settings | FrameType::Ping | FrameType::Goaway)
    }

    /// Whether frames of this type must carry a non-zero stream id
    pub fn requires_stream(&self) -> bool {
        matches!(
            self,
            FrameType::Data
                | FrameType::Headers
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::PushPromise
                | FrameType::Continuation
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Create empty flags
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Create from u8
    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    /// Get raw u8 value
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set a flag
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Set a flag when `on` is true
    pub fn set_if(&mut self, flag: u8, on: bool) {
        if on {
            self.set(flag);
        }
    }

    /// Check if a flag is set
    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    // Common flags

    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;

    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;

    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;

    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;

    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    /// Check if END_STREAM is set
    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    /// Check if ACK is set
    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    /// Check if END_HEADERS is set
    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    /// Check if PADDED is set
    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    /// Check if PRIORITY is set
    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A parsed or to-be-written HTTP/2 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
}

impl Frame {
    /// Frame type tag
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Priority(_) => FrameType::Priority,
            Frame::RstStream(_) => FrameType::RstStream,
            Frame::Settings(_) => FrameType::Settings,
            Frame::PushPromise(_) => FrameType::PushPromise,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Goaway(_) => FrameType::Goaway,
            Frame::WindowUpdate(_) => FrameType::WindowUpdate,
            Frame::Continuation(_) => FrameType::Continuation,
        }
    }

    /// Stream identifier (0 for connection-level frames)
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::Goaway(_) => CONNECTION_STREAM_ID,
        }
    }

    /// Wire flags this frame is written with
    pub fn flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        match self {
            Frame::Data(f) => {
                flags.set_if(FrameFlags::END_STREAM, f.end_stream);
                flags.set_if(FrameFlags::PADDED, f.padding.is_some());
            }
            Frame::Headers(f) => {
                flags.set_if(FrameFlags::END_STREAM, f.end_stream);
                flags.set_if(FrameFlags::END_HEADERS, f.end_headers);
                flags.set_if(FrameFlags::PADDED, f.padding.is_some());
                flags.set_if(FrameFlags::PRIORITY, f.priority.is_some());
            }
            Frame::Settings(f) => flags.set_if(FrameFlags::ACK, f.ack),
            Frame::PushPromise(f) => {
                flags.set_if(FrameFlags::END_HEADERS, f.end_headers);
                flags.set_if(FrameFlags::PADDED, f.padding.is_some());
            }
            Frame::Ping(f) => flags.set_if(FrameFlags::ACK, f.ack),
            Frame::Continuation(f) => flags.set_if(FrameFlags::END_HEADERS, f.end_headers),
            Frame::Priority(_) | Frame::RstStream(_) | Frame::Goaway(_) | Frame::WindowUpdate(_) => {}
        }
        flags
    }

    /// Whether this frame closes its side of the stream
    pub fn is_end_stream(&self) -> bool {
        match self {
            Frame::Data(f) => f.end_stream,
            Frame::Headers(f) => f.end_stream,
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} flags=0x{:02x}",
            self.frame_type().name(),
            self.stream_id(),
            self.flags().as_u8()
        )
    }
}

macro_rules! frame_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(impl From<$ty> for Frame {
            fn from(frame: $ty) -> Self {
                Frame::$variant(frame)
            }
        })*
    };
}

frame_from!(
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
);

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Data payload
    pub data: Bytes,
    /// END_STREAM flag
    pub end_stream: bool,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl DataFrame {
    /// Create a new DATA frame
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Get total payload size including padding; this is what flow control counts
    pub fn frame_size(&self) -> usize {
        let mut size = self.data.len();
        if let Some(pad_len) = self.padding {
            size += 1 + pad_len as usize; // 1 byte for pad length field + padding
        }
        size
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    /// END_STREAM flag
    pub end_stream: bool,
    /// END_HEADERS flag
    pub end_headers: bool,
    /// Priority information (if PRIORITY flag is set)
    pub priority: Option<PrioritySpec>,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl HeadersFrame {
    /// Create a new HEADERS frame
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
            padding: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// Priority specification (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    /// Stream dependency
    pub stream_dependency: u32,
    /// Exclusive flag
    pub exclusive: bool,
    /// Weight as sent on the wire (0-255, effective weight is one more)
    pub weight: u8,
}

impl PrioritySpec {
    /// Create a new priority specification
    pub fn new(stream_dependency: u32, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

/// PRIORITY frame (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Priority specification
    pub priority: PrioritySpec,
}

impl PriorityFrame {
    pub fn new(stream_id: u32, priority: PrioritySpec) -> Self {
        PriorityFrame { stream_id, priority }
    }
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Error code
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        RstStreamFrame { stream_id, error_code }
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    /// ACK flag
    pub ack: bool,
    /// Settings parameters
    pub settings: Settings,
}

impl SettingsFrame {
    /// Create a new SETTINGS frame
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Create a SETTINGS ACK frame
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Promised stream ID
    pub promised_stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    /// END_HEADERS flag
    pub end_headers: bool,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl PushPromiseFrame {
    pub fn new(stream_id: u32, promised_stream_id: u32, header_block: Bytes, end_headers: bool) -> Self {
        PushPromiseFrame {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    /// ACK flag
    pub ack: bool,
    /// Opaque data (8 bytes)
    pub data: [u8; 8],
}

impl PingFrame {
    /// Create a new PING frame
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Create a PING ACK frame
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Last stream ID
    pub last_stream_id: u32,
    /// Error code
    pub error_code: ErrorCode,
    /// Debug data
    pub debug_data: Bytes,
}

impl GoawayFrame {
    /// Create a new GOAWAY frame
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// Stream ID (0 for connection-level)
    pub stream_id: u32,
    /// Window size increment
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    /// Create a new WINDOW_UPDATE frame
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// CONTINUATION frame (RFC 7540 Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    /// END_HEADERS flag
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_headers: bool) -> Self {
        ContinuationFrame {
            stream_id,
            header_block,
            end_headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Data.as_u8(), 0x0);
        assert_eq!(FrameType::Headers.as_u8(), 0x1);
        assert_eq!(FrameType::Continuation.as_u8(), 0x9);

        assert_eq!(FrameType::from_u8(0x0), Some(FrameType::Data));
        assert_eq!(FrameType::from_u8(0x9), Some(FrameType::Continuation));
        assert_eq!(FrameType::from_u8(0xff), None);
    }

    #[test]
    fn test_frame_type_name() {
        assert_eq!(FrameType::Data.name(), "DATA");
        assert_eq!(FrameType::Headers.name(), "HEADERS");
        assert_eq!(FrameType::Settings.name(), "SETTINGS");
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        assert!(!flags.is_end_stream());

        flags.set(FrameFlags::END_STREAM);
        assert!(flags.is_end_stream());
        assert!(!flags.is_end_headers());

        flags.set(FrameFlags::END_HEADERS);
        assert!(flags.is_end_stream());
        assert!(flags.is_end_headers());
    }

    #[test]
    fn test_data_frame() {
        let data = Bytes::from("Hello");
        let frame = DataFrame::new(1, data.clone(), true);

        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.data, data);
        assert!(frame.end_stream);
        assert_eq!(frame.padding, None);
        assert_eq!(frame.frame_size(), 5);

        let frame_with_padding = frame.with_padding(10);
        assert_eq!(frame_with_padding.padding, Some(10));
        assert_eq!(frame_with_padding.frame_size(), 16); // 5 + 1 + 10
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::from(
            HeadersFrame::new(3, Bytes::from_static(b"\x82"), true, true)
                .with_priority(PrioritySpec::new(1, false, 15)),
        );
        assert_eq!(frame.frame_type(), FrameType::Headers);
        assert_eq!(frame.stream_id(), 3);
        assert!(frame.is_end_stream());
        let flags = frame.flags();
        assert!(flags.is_end_headers());
        assert!(flags.is_priority());
        assert!(!flags.is_padded());

        let ping = Frame::from(PingFrame::ack([0; 8]));
        assert_eq!(ping.stream_id(), CONNECTION_STREAM_ID);
        assert!(ping.flags().is_ack());
    }

    #[test]
    fn test_frame_structural_equality() {
        let a = Frame::from(DataFrame::new(1, Bytes::from("abc"), false));
        let b = Frame::from(DataFrame::new(1, Bytes::from(b"abc".to_vec()), false));
        let c = Frame::from(DataFrame::new(1, Bytes::from("abc"), true));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stream_scope_rules() {
        assert!(FrameType::Settings.is_connection_level());
        assert!(!FrameType::WindowUpdate.is_connection_level());
        assert!(!FrameType::WindowUpdate.requires_stream());
        assert!(FrameType::Continuation.requires_stream());
    }

    #[test]
    fn test_settings_frame() {
        let settings = Settings::default();
        let frame = SettingsFrame::new(settings);
        assert!(!frame.ack);

        let ack_frame = SettingsFrame::ack();
        assert!(ack_frame.ack);
    }

    #[test]
    fn test_ping_frame() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let ping = PingFrame::new(data);
        assert!(!ping.ack);
        assert_eq!(ping.data, data);

        let pong = PingFrame::ack(data);
        assert!(pong.ack);
        assert_eq!(pong.data, data);
    }
}
