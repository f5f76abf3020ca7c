//! h2link - HTTP/2 client connection engine for protocol testing
//!
//! This crate drives HTTP/2 connections the way a conformance harness needs
//! to: every frame type is parsed and built explicitly, sequencing violations
//! are reported instead of papered over, and the frames a peer sends can be
//! checked against expectations. Server-side channels get a quiesce
//! coordinator for orderly shutdown.

pub mod config;
pub mod http;
pub mod pool;
pub mod quiesce;
pub mod transport;
