//! HTTP/2 client connection engine
//!
//! The pieces, bottom-up:
//!
//! - **Frames** ([`frames`], [`codec`]): typed frames for all ten RFC 7540
//!   frame types and a stateful parser that copes with frames split across
//!   reads or packed several to a read.
//! - **Protocol state** ([`settings`], [`flow_control`], [`stream`]): SETTINGS
//!   exchange, window accounting, per-stream state.
//! - **Header compression** ([`hpack`]): HPACK behind the [`HeaderCodec`] trait.
//! - **Connection** ([`connection`]): the sans-IO [`ConnectionCore`] that turns
//!   inbound bytes into side effects and queued frames, and the tokio-driven
//!   [`H2Connection`] that owns the transport, the read task and the single
//!   writer ([`write_queue`]).
//! - **Test support** ([`tracker`], [`hooks`]): expected-versus-observed frame
//!   bookkeeping and optional reactions to inbound frames.
//!
//! # Example
//!
//! ```no_run
//! use h2link::config::ConnectionBuilder;
//! use h2link::http::h2::{H2Connection, hpack::fields};
//! use h2link::pool::BufferPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionBuilder::new().host("localhost").port(8080).build()?;
//! let conn = H2Connection::connect(config, Arc::new(BufferPool::default())).await?;
//! conn.wait_established(Duration::from_secs(5)).await?;
//!
//! let stream_id = conn.request(fields(&[(":method", "GET"), (":path", "/")]), None).await?;
//! println!("sent request on stream {}", stream_id);
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod hooks;
pub mod hpack;
pub mod settings;
pub mod stream;
pub mod tracker;
pub mod write_queue;

pub use codec::{FrameCodec, FrameStatus};
pub use connection::{ConnectionCore, H2Connection, Phase, SendOutcome};
pub use error::{Error, ErrorCategory, ErrorCode, Result, SequenceError};
pub use frames::{
    ContinuationFrame, DataFrame, Frame, FrameFlags, FrameType, GoawayFrame, HeadersFrame,
    PingFrame, PriorityFrame, PrioritySpec, PushPromiseFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
pub use hooks::{FrameHook, SentinelHook};
pub use self::hpack::{HeaderCodec, HeaderField, HpackCodec};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2Stream, StreamId, StreamState};
pub use tracker::{Arrival, ExpectedFrame, FrameTracker, ObservedFrame};
pub use write_queue::WriteQueue;

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
