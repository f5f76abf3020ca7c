//! Stream result tracking
//!
//! Tests register the frames they expect the peer to send; the connection
//! reports every frame it receives. Comparisons use decoded content, so a
//! header block split over CONTINUATION frames or a padded DATA frame still
//! matches an expectation written in plain terms.

use super::frames::{Frame, FrameFlags, FrameType};
use super::hpack::HeaderField;
use super::CONNECTION_STREAM_ID;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Payload of an observed frame in comparable form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameContent {
    /// Decoded header list (HEADERS and PUSH_PROMISE)
    Headers(Vec<HeaderField>),
    /// DATA payload with padding removed
    Data(Bytes),
    /// Any other frame, compared whole
    Frame(Frame),
}

/// A frame as seen by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedFrame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    /// Only flags that survive re-encoding (END_STREAM, ACK)
    pub flags: FrameFlags,
    pub content: FrameContent,
}

impl ObservedFrame {
    /// A completed header block
    pub fn headers(stream_id: u32, fields: Vec<HeaderField>, end_stream: bool) -> Self {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, end_stream);
        ObservedFrame {
            frame_type: FrameType::Headers,
            stream_id,
            flags,
            content: FrameContent::Headers(fields),
        }
    }

    /// A PUSH_PROMISE header block, observed on the associated stream
    pub fn push_promise(stream_id: u32, fields: Vec<HeaderField>) -> Self {
        ObservedFrame {
            frame_type: FrameType::PushPromise,
            stream_id,
            flags: FrameFlags::empty(),
            content: FrameContent::Headers(fields),
        }
    }

    pub fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, end_stream);
        ObservedFrame {
            frame_type: FrameType::Data,
            stream_id,
            flags,
            content: FrameContent::Data(data),
        }
    }

    /// Build from a frame that does not carry a header block
    pub fn from_frame(frame: &Frame) -> Self {
        match frame {
            Frame::Data(data) => Self::data(data.stream_id, data.data.clone(), data.end_stream),
            other => {
                let mut flags = FrameFlags::empty();
                flags.set_if(FrameFlags::ACK, other.flags().is_ack() && carries_ack(other));
                ObservedFrame {
                    frame_type: other.frame_type(),
                    stream_id: other.stream_id(),
                    flags,
                    content: FrameContent::Frame(other.clone()),
                }
            }
        }
    }

    pub fn is_end_stream(&self) -> bool {
        matches!(self.frame_type, FrameType::Data | FrameType::Headers) && self.flags.is_end_stream()
    }
}

fn carries_ack(frame: &Frame) -> bool {
    matches!(frame, Frame::Settings(_) | Frame::Ping(_))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// Any frame of the type on the stream
    Any,
    Exact(ObservedFrame),
}

/// A frame the test expects the peer to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFrame {
    frame_type: FrameType,
    stream_id: u32,
    matcher: Matcher,
}

impl ExpectedFrame {
    pub fn headers(stream_id: u32, fields: Vec<HeaderField>, end_stream: bool) -> Self {
        Self::exact_observed(ObservedFrame::headers(stream_id, fields, end_stream))
    }

    pub fn data(stream_id: u32, data: impl Into<Bytes>, end_stream: bool) -> Self {
        Self::exact_observed(ObservedFrame::data(stream_id, data.into(), end_stream))
    }

    /// Any frame of `frame_type` on `stream_id`
    pub fn of_type(frame_type: FrameType, stream_id: u32) -> Self {
        ExpectedFrame {
            frame_type,
            stream_id,
            matcher: Matcher::Any,
        }
    }

    /// Exactly this frame; use [`ExpectedFrame::headers`] for header blocks
    pub fn exact(frame: &Frame) -> Self {
        Self::exact_observed(ObservedFrame::from_frame(frame))
    }

    fn exact_observed(observed: ObservedFrame) -> Self {
        ExpectedFrame {
            frame_type: observed.frame_type,
            stream_id: observed.stream_id,
            matcher: Matcher::Exact(observed),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn matches(&self, observed: &ObservedFrame) -> bool {
        if observed.frame_type != self.frame_type || observed.stream_id != self.stream_id {
            return false;
        }
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Exact(want) => want == observed,
        }
    }
}

/// How an observed frame related to the registered expectations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Matched the next outstanding expectation on its stream
    Matched,
    /// Matched an expectation registered after one still outstanding
    OutOfOrder,
    /// Matched an expectation that had already arrived
    Duplicate,
    /// Matched nothing
    Unexpected,
    /// Arrived on a stream the peer had already ended
    AfterEndStream,
}

#[derive(Debug)]
struct Entry {
    expected: ExpectedFrame,
    arrived: bool,
}

/// Records expected and observed frames per stream
#[derive(Debug, Default)]
pub struct FrameTracker {
    expected: Vec<Entry>,
    arrivals: HashMap<u32, Vec<ObservedFrame>>,
    ended: HashSet<u32>,
}

impl FrameTracker {
    pub fn new() -> Self {
        FrameTracker::default()
    }

    pub fn add_expected(&mut self, expected: ExpectedFrame) {
        self.expected.push(Entry {
            expected,
            arrived: false,
        });
    }

    /// Whether any expectation of this type was registered
    pub fn expects(&self, frame_type: FrameType) -> bool {
        self.expected.iter().any(|e| e.expected.frame_type == frame_type)
    }

    /// Record an observed frame and classify it
    pub fn record_arrived(&mut self, observed: ObservedFrame) -> Arrival {
        let stream_id = observed.stream_id;
        let arrival = if stream_id != CONNECTION_STREAM_ID && self.ended.contains(&stream_id) {
            Arrival::AfterEndStream
        } else {
            self.classify(&observed)
        };

        match arrival {
            Arrival::Unexpected | Arrival::AfterEndStream => {
                warn!(stream_id, frame_type = %observed.frame_type, ?arrival, "frame not expected")
            }
            _ => debug!(stream_id, frame_type = %observed.frame_type, ?arrival, "frame arrived"),
        }

        if observed.is_end_stream() {
            self.ended.insert(stream_id);
        }
        // Connection-level frames are kept only when something expected them
        if stream_id != CONNECTION_STREAM_ID || arrival != Arrival::Unexpected {
            self.arrivals.entry(stream_id).or_default().push(observed);
        }
        arrival
    }

    fn classify(&mut self, observed: &ObservedFrame) -> Arrival {
        let pending = self
            .expected
            .iter()
            .position(|e| !e.arrived && e.expected.matches(observed));

        match pending {
            Some(index) => {
                let skipped = self.expected[..index]
                    .iter()
                    .any(|e| !e.arrived && e.expected.stream_id == observed.stream_id);
                self.expected[index].arrived = true;
                if skipped {
                    Arrival::OutOfOrder
                } else {
                    Arrival::Matched
                }
            }
            None if self.expected.iter().any(|e| e.expected.matches(observed)) => Arrival::Duplicate,
            None => Arrival::Unexpected,
        }
    }

    /// Whether a frame matching `expected` has been observed
    pub fn did_arrive(&self, expected: &ExpectedFrame) -> bool {
        self.arrivals
            .get(&expected.stream_id)
            .map(|seen| seen.iter().any(|o| expected.matches(o)))
            .unwrap_or(false)
    }

    /// Whether every registered expectation has been met
    pub fn all_arrived(&self) -> bool {
        self.expected.iter().all(|e| e.arrived)
    }

    /// Expectations still outstanding, in registration order
    pub fn missing(&self) -> Vec<ExpectedFrame> {
        self.expected
            .iter()
            .filter(|e| !e.arrived)
            .map(|e| e.expected.clone())
            .collect()
    }

    /// Whether the peer has sent END_STREAM on `stream_id`
    pub fn stream_ended(&self, stream_id: u32) -> bool {
        self.ended.contains(&stream_id)
    }

    /// Frames observed on `stream_id`, in arrival order. For stream 0 only
    /// frames that matched an expectation are listed.
    pub fn arrivals(&self, stream_id: u32) -> &[ObservedFrame] {
        self.arrivals.get(&stream_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::frames::{DataFrame, PingFrame, SettingsFrame};
    use crate::http::h2::hpack::fields;

    #[test]
    fn test_matched_in_order() {
        let mut tracker = FrameTracker::new();
        let headers = ExpectedFrame::headers(1, fields(&[(":status", "200")]), false);
        let body = ExpectedFrame::data(1, "hello", true);
        tracker.add_expected(headers.clone());
        tracker.add_expected(body.clone());

        let arrival = tracker.record_arrived(ObservedFrame::headers(
            1,
            fields(&[(":status", "200")]),
            false,
        ));
        assert_eq!(arrival, Arrival::Matched);
        assert!(!tracker.all_arrived());
        assert_eq!(tracker.missing(), vec![body.clone()]);

        let arrival = tracker.record_arrived(ObservedFrame::data(1, Bytes::from("hello"), true));
        assert_eq!(arrival, Arrival::Matched);
        assert!(tracker.all_arrived());
        assert!(tracker.did_arrive(&headers));
        assert!(tracker.stream_ended(1));
        assert_eq!(tracker.arrivals(1).len(), 2);
    }

    #[test]
    fn test_padding_does_not_affect_match() {
        let mut tracker = FrameTracker::new();
        tracker.add_expected(ExpectedFrame::data(3, "abc", false));
        let padded = DataFrame::new(3, Bytes::from("abc"), false).with_padding(7);
        assert_eq!(
            tracker.record_arrived(ObservedFrame::from_frame(&Frame::Data(padded))),
            Arrival::Matched
        );
    }

    #[test]
    fn test_out_of_order_and_duplicate() {
        let mut tracker = FrameTracker::new();
        tracker.add_expected(ExpectedFrame::data(1, "first", false));
        tracker.add_expected(ExpectedFrame::data(1, "second", false));

        assert_eq!(
            tracker.record_arrived(ObservedFrame::data(1, Bytes::from("second"), false)),
            Arrival::OutOfOrder
        );
        assert_eq!(
            tracker.record_arrived(ObservedFrame::data(1, Bytes::from("second"), false)),
            Arrival::Duplicate
        );
        assert_eq!(
            tracker.record_arrived(ObservedFrame::data(1, Bytes::from("first"), false)),
            Arrival::Matched
        );
    }

    #[test]
    fn test_streams_are_ordered_independently() {
        let mut tracker = FrameTracker::new();
        tracker.add_expected(ExpectedFrame::of_type(FrameType::Headers, 1));
        tracker.add_expected(ExpectedFrame::of_type(FrameType::Headers, 3));
        let arrival = tracker.record_arrived(ObservedFrame::headers(3, vec![], false));
        assert_eq!(arrival, Arrival::Matched);
    }

    #[test]
    fn test_unexpected_and_after_end_stream() {
        let mut tracker = FrameTracker::new();
        assert_eq!(
            tracker.record_arrived(ObservedFrame::from_frame(&Frame::Ping(PingFrame::new([0; 8])))),
            Arrival::Unexpected
        );

        tracker.record_arrived(ObservedFrame::headers(5, vec![], true));
        assert_eq!(
            tracker.record_arrived(ObservedFrame::data(5, Bytes::new(), false)),
            Arrival::AfterEndStream
        );
    }

    #[test]
    fn test_unexpected_control_frames_not_retained() {
        let mut tracker = FrameTracker::new();
        for i in 0..1000u32 {
            let ping = Frame::Ping(PingFrame::new((i as u64).to_be_bytes()));
            tracker.record_arrived(ObservedFrame::from_frame(&ping));
        }
        assert!(tracker.arrivals(CONNECTION_STREAM_ID).is_empty());

        let ack = Frame::Settings(SettingsFrame::ack());
        tracker.add_expected(ExpectedFrame::exact(&ack));
        tracker.record_arrived(ObservedFrame::from_frame(&ack));
        assert_eq!(tracker.arrivals(CONNECTION_STREAM_ID).len(), 1);
        assert!(tracker.did_arrive(&ExpectedFrame::exact(&ack)));

        // Stream frames are kept whether or not they were expected
        tracker.record_arrived(ObservedFrame::data(1, Bytes::from("x"), false));
        assert_eq!(tracker.arrivals(1).len(), 1);
    }

    #[test]
    fn test_exact_control_frame() {
        let mut tracker = FrameTracker::new();
        let ack = Frame::Settings(SettingsFrame::ack());
        tracker.add_expected(ExpectedFrame::exact(&ack));
        assert!(tracker.expects(FrameType::Settings));
        assert!(!tracker.expects(FrameType::Goaway));

        let non_ack = Frame::Settings(SettingsFrame::new(Default::default()));
        assert_eq!(
            tracker.record_arrived(ObservedFrame::from_frame(&non_ack)),
            Arrival::Unexpected
        );
        assert_eq!(tracker.record_arrived(ObservedFrame::from_frame(&ack)), Arrival::Matched);
    }
}
