//! Post-processing hooks for inbound frames
//!
//! A hook sees every inbound frame after the connection has applied its
//! protocol side effects and recorded the frame. Frames it returns are
//! queued for sending like any other outbound frame.

use super::frames::{Frame, PingFrame, PriorityFrame, PrioritySpec, WindowUpdateFrame};
use super::CONNECTION_STREAM_ID;
use tracing::debug;

/// Hook invoked for every inbound frame
pub trait FrameHook: Send {
    /// Frames to send in reaction to `frame`
    fn after_frame(&mut self, frame: &Frame) -> Vec<Frame>;
}

/// DATA payload that asks the client to send a PRIORITY frame on the same stream
pub const SEND_PRIORITY: &[u8] = b"H2_SEND_PRIORITY";
/// DATA payload that asks the client to send a connection WINDOW_UPDATE
pub const SEND_WINDOW_UPDATE: &[u8] = b"H2_SEND_WINDOW_UPDATE";
/// DATA payload that asks the client to send a PING
pub const SEND_PING: &[u8] = b"H2_SEND_PING";

/// Test control channel: a peer asks for specific client frames by sending
/// well-known DATA payloads
#[derive(Debug, Clone)]
pub struct SentinelHook {
    priority: PrioritySpec,
    window_increment: u32,
    ping_payload: [u8; 8],
}

impl SentinelHook {
    pub fn new() -> Self {
        SentinelHook {
            priority: PrioritySpec::new(CONNECTION_STREAM_ID, false, 15),
            window_increment: 1,
            ping_payload: *b"h2sentnl",
        }
    }

    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_window_increment(mut self, increment: u32) -> Self {
        self.window_increment = increment;
        self
    }

    pub fn with_ping_payload(mut self, payload: [u8; 8]) -> Self {
        self.ping_payload = payload;
        self
    }
}

impl Default for SentinelHook {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHook for SentinelHook {
    fn after_frame(&mut self, frame: &Frame) -> Vec<Frame> {
        let Frame::Data(data) = frame else {
            return Vec::new();
        };

        let reply = match &data.data[..] {
            SEND_PRIORITY => Frame::Priority(PriorityFrame::new(data.stream_id, self.priority)),
            SEND_WINDOW_UPDATE => Frame::WindowUpdate(WindowUpdateFrame::new(
                CONNECTION_STREAM_ID,
                self.window_increment,
            )),
            SEND_PING => Frame::Ping(PingFrame::new(self.ping_payload)),
            _ => return Vec::new(),
        };
        debug!(stream_id = data.stream_id, reply = %reply, "sentinel payload received");
        vec![reply]
    }
}
