//! Shared test helpers

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use h2link::http::h2::{Frame, FrameCodec, FrameStatus};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Parse every complete frame in `bytes`
pub fn parse_frames(bytes: &[u8]) -> Vec<Frame> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match codec.process_next_buffer(&mut buf).unwrap() {
            FrameStatus::Incomplete => break,
            _ => frames.extend(codec.take_frame()),
        }
    }
    frames
}

pub fn concat(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.iter().copied()).collect()
}
