//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 7540 Section 7.

use super::frames::FrameType;
use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the HTTP/1.1 upgrade layer
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame sequencing violation
    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Our SETTINGS were not on the wire in time to acknowledge the peer's
    #[error("Settings timeout")]
    SettingsTimeout,

    /// Stream closed (RFC 7540 Section 7 - Error code 0x5)
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Too many streams
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Operation not valid in the current connection phase
    #[error("Connection not ready: {0}")]
    NotReady(String),

    /// Timeout waiting for operation
    #[error("Timeout")]
    Timeout,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer did not close the transport after GOAWAY
    #[error("Connection not closed after {0:?}")]
    NotClosed(std::time::Duration),
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Http(_) => ErrorCategory::Handshake,
            Error::Protocol(_)
            | Error::FrameSize(_)
            | Error::InvalidSettings(_)
            | Error::TooManyStreams
            | Error::Internal(_)
            | Error::NotReady(_) => ErrorCategory::Protocol,
            Error::Sequence(_) | Error::StreamClosed(_) => ErrorCategory::Sequence,
            Error::Compression(_) => ErrorCategory::Compression,
            Error::FlowControl(_) => ErrorCategory::FlowControl,
            Error::Io(_) => ErrorCategory::Io,
            Error::Timeout | Error::SettingsTimeout => ErrorCategory::Timeout,
            Error::ConnectionClosed | Error::NotClosed(_) => ErrorCategory::Closed,
        }
    }

    /// The GOAWAY/RST_STREAM code that best describes this error
    pub fn error_code(&self) -> ErrorCode {
        match self.category() {
            ErrorCategory::Compression => ErrorCode::CompressionError,
            ErrorCategory::FlowControl => ErrorCode::FlowControlError,
            ErrorCategory::Timeout => ErrorCode::SettingsTimeout,
            _ => match self {
                Error::FrameSize(_) => ErrorCode::FrameSizeError,
                Error::StreamClosed(_) => ErrorCode::StreamClosed,
                Error::Internal(_) | Error::Io(_) => ErrorCode::InternalError,
                _ => ErrorCode::ProtocolError,
            },
        }
    }
}

/// Broad classes of failure used when draining a connection's error list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or incomplete upgrade response
    Handshake,
    /// Malformed frame or rule violation
    Protocol,
    /// Frame arrived in an order the protocol forbids
    Sequence,
    /// HPACK failure
    Compression,
    /// Window accounting failure
    FlowControl,
    /// Transport failure
    Io,
    /// Bounded wait expired
    Timeout,
    /// Connection already gone
    Closed,
}

/// Frame sequencing violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("{frame_type} received on stream {stream_id} after END_STREAM")]
    FrameAfterEndStream { stream_id: u32, frame_type: FrameType },

    #[error("{frame_type} received on stream {stream_id} after END_HEADERS")]
    HeadersAfterEndHeaders { stream_id: u32, frame_type: FrameType },

    #[error("{frame_type} received on stream {stream_id} while header block of stream {open_stream} is open")]
    HeaderBlockInterrupted {
        stream_id: u32,
        open_stream: u32,
        frame_type: FrameType,
    },

    #[error("first frame from peer was {0}, expected SETTINGS")]
    UnexpectedFirstFrame(FrameType),

    #[error("unexpected GOAWAY: last stream {last_stream_id}, {error_code}")]
    UnexpectedGoaway {
        last_stream_id: u32,
        error_code: ErrorCode,
    },
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Decode a wire value; unknown codes are treated as INTERNAL_ERROR (RFC 7540 Section 7)
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NoError.as_u32(), 0x0);
        assert_eq!(ErrorCode::ProtocolError.as_u32(), 0x1);
        assert_eq!(ErrorCode::Http11Required.as_u32(), 0xd);

        assert_eq!(ErrorCode::from_u32(0x0), Some(ErrorCode::NoError));
        assert_eq!(ErrorCode::from_u32(0x1), Some(ErrorCode::ProtocolError));
        assert_eq!(ErrorCode::from_u32(0xff), None);
        assert_eq!(ErrorCode::from_wire(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_code_name() {
        assert_eq!(ErrorCode::NoError.name(), "NO_ERROR");
        assert_eq!(ErrorCode::ProtocolError.name(), "PROTOCOL_ERROR");
        assert_eq!(ErrorCode::FlowControlError.name(), "FLOW_CONTROL_ERROR");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Protocol("test error".to_string());
        assert_eq!(err.to_string(), "Protocol error: test error");

        let err = Error::StreamClosed(42);
        assert_eq!(err.to_string(), "Stream closed: 42");

        let err = Error::from(SequenceError::UnexpectedFirstFrame(FrameType::Ping));
        assert_eq!(
            err.to_string(),
            "Sequence error: first frame from peer was PING (0x6), expected SETTINGS"
        );
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            Error::Compression("bad".into()).category(),
            ErrorCategory::Compression
        );
        assert_eq!(
            Error::from(SequenceError::FrameAfterEndStream {
                stream_id: 1,
                frame_type: FrameType::Data,
            })
            .category(),
            ErrorCategory::Sequence
        );
        assert_eq!(
            Error::from(crate::http::Error::Handshake("missing".into())).category(),
            ErrorCategory::Handshake
        );
        assert_eq!(Error::FrameSize("x".into()).error_code(), ErrorCode::FrameSizeError);
    }
}
